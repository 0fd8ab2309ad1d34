use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemStruct};

extern crate proc_macro;

/// Turn a plain struct into a workload outcome.
///
/// Derives `Serialize`, `Deserialize`, `Debug`, `Clone` and `PartialEq`, and
/// implements `Outcome` with the default status (always passed). `Outcome`
/// must be in scope where the attribute is used.
#[proc_macro_attribute]
pub fn outcome(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let ident = &ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast

        impl #impl_generics Outcome for #ident #ty_generics #where_clause {}
    };

    TokenStream::from(expanded)
}
