//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test, `#[test_timeout::tokio_timeout_test]`
//! an async one (run on a current-thread runtime). Both accept an optional limit in seconds,
//! e.g. `#[test_timeout::tokio_timeout_test(10)]`; the default is 60.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(attr, function, Flavor::Tokio)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(attr, function, Flavor::Sync)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[derive(Clone, Copy)]
enum Flavor {
    Sync,
    Tokio,
}

fn expand(attr: TokenStream, function: ItemFn, flavor: Flavor) -> syn::Result<TokenStream2> {
    let secs = parse_timeout(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = function;

    let body = match flavor {
        Flavor::Sync => {
            if sig.asyncness.is_some() {
                return Err(syn::Error::new_spanned(
                    &sig.ident,
                    "timeout expects a synchronous test; use tokio_timeout_test for async tests",
                ));
            }
            quote! { #block }
        }
        Flavor::Tokio => {
            if sig.asyncness.take().is_none() {
                return Err(syn::Error::new_spanned(
                    &sig.ident,
                    "tokio_timeout_test can only be applied to async functions",
                ));
            }
            quote! {
                {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(limit, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }
            }
        }
    };

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#secs);
            let (report, outcome) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
                let _ = report.send(result);
            });
            match outcome.recv_timeout(limit) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread ended without reporting a result")
                }
            }
        }
    })
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let literal: LitInt = syn::parse(attr)?;
    let secs: u64 = literal.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(
            literal,
            "timeout must be greater than zero",
        ));
    }
    Ok(secs)
}

/// `#[test]` or `#[tokio::test]`, which the expansion replaces.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
