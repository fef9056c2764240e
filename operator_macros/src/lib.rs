extern crate proc_macro;
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemStruct};

/// Registers an analysis operator in the global operator registry at program start.
///
/// The annotated struct must implement `crate::operators::operator::Operator`.
#[proc_macro_attribute]
pub fn register_operator(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemStruct);
    let struct_name = &input.ident;

    let fn_name_str = heck::ToSnakeCase::to_snake_case(struct_name.to_string().as_str());
    let fn_name = syn::Ident::new(
        &format!("register_operator_{}", fn_name_str),
        struct_name.span(),
    );

    let expanded = quote! {
        #input

        #[ctor::ctor]
        fn #fn_name() {
            crate::operators::operator::OperatorRegistry::register_operator::<#struct_name>();
        }
    };

    TokenStream::from(expanded)
}
