//! Derive macro for the canonical dictionary codec.
//!
//! Generates `PlainValue` implementations so a type round-trips through the
//! canonical value tree. Named-field structs become dictionaries keyed by
//! field name (the encoder sorts keys, so the layout is deterministic no
//! matter the declaration order); field-less enums become text values
//! carrying the variant name.
//!
//! # Generated Code
//!
//! ```ignore
//! #[derive(PlainValue)]
//! struct Attack { weapon: String, target: String }
//!
//! impl PlainValue for Attack {
//!     fn to_value(&self) -> Value {
//!         // { "target": ..., "weapon": ... }
//!     }
//!     fn from_value(value: &Value) -> Result<Self, ValueError> {
//!         // field-by-field extraction with per-field errors
//!     }
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};

pub fn derive_plain_value(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (to_body, from_body) = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => named_struct_bodies(fields),
            _ => {
                return Err(syn::Error::new_spanned(
                    input,
                    "PlainValue derive requires named fields on structs",
                ));
            }
        },
        Data::Enum(data) => {
            if data.variants.iter().any(|v| !matches!(v.fields, Fields::Unit)) {
                return Err(syn::Error::new_spanned(
                    input,
                    "PlainValue derive supports only field-less enum variants",
                ));
            }
            unit_enum_bodies(name, data)
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "PlainValue derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics crate::types::value::PlainValue for #name #ty_generics #where_clause {
            fn to_value(&self) -> crate::types::value::Value {
                #to_body
            }

            fn from_value(
                value: &crate::types::value::Value,
            ) -> ::std::result::Result<Self, crate::types::value::ValueError> {
                #from_body
            }
        }
    })
}

fn named_struct_bodies(fields: &syn::FieldsNamed) -> (TokenStream2, TokenStream2) {
    let idents: Vec<_> = fields.named.iter().map(|f| f.ident.as_ref().unwrap()).collect();
    let keys: Vec<String> = idents.iter().map(|ident| ident.to_string()).collect();

    let inserts = idents.iter().zip(&keys).map(|(ident, key)| {
        quote! {
            entries.insert(
                crate::types::value::Key::text(#key),
                crate::types::value::PlainValue::to_value(&self.#ident),
            );
        }
    });
    let to_body = quote! {
        let mut entries = ::std::collections::BTreeMap::new();
        #(#inserts)*
        crate::types::value::Value::Dict(entries)
    };

    let extracts = idents.iter().zip(&keys).map(|(ident, key)| {
        quote! {
            #ident: crate::types::value::PlainValue::from_value(
                entries
                    .get(&crate::types::value::Key::text(#key))
                    .ok_or(crate::types::value::ValueError::MissingField(#key))?,
            )?,
        }
    });
    let from_body = quote! {
        let entries = value.as_dict().ok_or(crate::types::value::ValueError::Mismatch {
            expected: "dictionary",
        })?;
        Ok(Self {
            #(#extracts)*
        })
    };

    (to_body, from_body)
}

fn unit_enum_bodies(name: &syn::Ident, data: &syn::DataEnum) -> (TokenStream2, TokenStream2) {
    let idents: Vec<_> = data.variants.iter().map(|v| &v.ident).collect();
    let tags: Vec<String> = idents.iter().map(|ident| ident.to_string()).collect();

    let to_arms = idents.iter().zip(&tags).map(|(ident, tag)| {
        quote! { #name::#ident => crate::types::value::Value::text(#tag), }
    });
    let to_body = quote! {
        match self {
            #(#to_arms)*
        }
    };

    let from_arms = idents.iter().zip(&tags).map(|(ident, tag)| {
        quote! { #tag => Ok(#name::#ident), }
    });
    let from_body = quote! {
        let tag = value.as_text().ok_or(crate::types::value::ValueError::Mismatch {
            expected: "text",
        })?;
        match tag {
            #(#from_arms)*
            _ => Err(crate::types::value::ValueError::Mismatch { expected: "known variant" }),
        }
    };

    (to_body, from_body)
}
