use proc_macro::TokenStream;
use quote::quote;
use syn::{DeriveInput, ItemFn, parse_macro_input};

/// Attributes allocations made by the function through
/// `memtrack::TrackingAllocator` to the function's location, labelled with
/// its module path.
///
/// Not available on `async fn`: the call-site scope lives in a thread-local
/// and cannot follow a future across threads.
#[proc_macro_attribute]
pub fn track(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    expand_track(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_track(input: &ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;

    if let Some(asyncness) = &sig.asyncness {
        return Err(syn::Error::new_spanned(
            asyncness,
            "#[memtrack::track] does not support async functions, wrap the synchronous parts in memtrack::track_block! instead",
        ));
    }

    let name = sig.ident.to_string();

    Ok(quote! {
        #(#attrs)*
        #vis #sig {
            let _memtrack_site = ::memtrack::SiteGuard::enter(
                ::memtrack::CallSite::new(file!(), line!())
                    .with_label(concat!(module_path!(), "::", #name)),
            );
            #block
        }
    })
}

/// Prints a leak report after the function returns, sync or async.
#[proc_macro_attribute]
pub fn check(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    expand_check(&input).into()
}

fn expand_check(input: &ItemFn) -> proc_macro2::TokenStream {
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;

    quote! {
        #(#attrs)*
        #vis #sig {
            let _memtrack_report = ::memtrack::ReportGuard::new();
            #block
        }
    }
}

#[proc_macro_derive(TrackedAlloc)]
pub fn derive_tracked_alloc(item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);
    expand_tracked_alloc(&input).into()
}

fn expand_tracked_alloc(input: &DeriveInput) -> proc_macro2::TokenStream {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    quote! {
        impl #impl_generics ::memtrack::TrackedAlloc for #name #ty_generics #where_clause {}
    }
}
