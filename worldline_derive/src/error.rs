//! Derive macro for error types.
//!
//! Every variant (or the type itself, for structs) declares its display
//! message with `#[error("...")]`. Messages interpolate tuple fields by
//! position (`{0}`) and named fields by name (`{key}`).

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, LitStr, parse_macro_input, spanned::Spanned};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let display_body = match &input.data {
        Data::Enum(data) => {
            let arms = data
                .variants
                .iter()
                .map(|variant| {
                    let message = message_for(&variant.attrs, variant.span())?;
                    let ident = &variant.ident;
                    Ok(match &variant.fields {
                        Fields::Unit => quote! {
                            Self::#ident => write!(f, #message),
                        },
                        Fields::Unnamed(fields) => {
                            let bindings: Vec<_> = (0..fields.unnamed.len())
                                .map(|i| format_ident!("field{i}"))
                                .collect();
                            let message = positional_to_bindings(&message, bindings.len());
                            quote! {
                                Self::#ident(#(#bindings),*) =>
                                    write!(f, #message, #(#bindings = #bindings),*),
                            }
                        }
                        Fields::Named(fields) => {
                            let bindings: Vec<_> =
                                fields.named.iter().map(|f| &f.ident).collect();
                            quote! {
                                Self::#ident { #(#bindings),* } =>
                                    write!(f, #message, #(#bindings = #bindings),*),
                            }
                        }
                    })
                })
                .collect::<syn::Result<Vec<_>>>()?;
            quote! {
                match self {
                    #(#arms)*
                }
            }
        }
        Data::Struct(data) => {
            let message = message_for(&input.attrs, input.span())?;
            match &data.fields {
                Fields::Unit => quote! { write!(f, #message) },
                Fields::Named(fields) => {
                    let names: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
                    quote! { write!(f, #message, #(#names = self.#names),*) }
                }
                Fields::Unnamed(fields) => {
                    let count = fields.unnamed.len();
                    let bindings: Vec<_> = (0..count).map(|i| format_ident!("field{i}")).collect();
                    let indices: Vec<_> = (0..count).map(syn::Index::from).collect();
                    let message = positional_to_bindings(&message, count);
                    quote! { write!(f, #message, #(#bindings = self.#indices),*) }
                }
            }
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "Error derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                #display_body
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}
    })
}

/// Finds the `#[error("...")]` attribute and returns its message literal.
fn message_for(attrs: &[syn::Attribute], span: proc_macro2::Span) -> syn::Result<String> {
    for attr in attrs {
        if attr.path().is_ident("error") {
            let lit: LitStr = attr.parse_args().map_err(|_| {
                syn::Error::new_spanned(
                    attr,
                    "expected a string literal: #[error(\"message with {fields}\")]",
                )
            })?;
            return Ok(lit.value());
        }
    }
    Err(syn::Error::new(
        span,
        "missing #[error(\"...\")] attribute declaring the display message",
    ))
}

/// Rewrites `{0}`, `{1}`, ... placeholders to the generated binding names.
fn positional_to_bindings(message: &str, count: usize) -> String {
    let mut rewritten = message.to_string();
    for i in (0..count).rev() {
        rewritten = rewritten.replace(&format!("{{{i}}}"), &format!("{{field{i}}}"));
        rewritten = rewritten.replace(&format!("{{{i}:"), &format!("{{field{i}:"));
    }
    rewritten
}
