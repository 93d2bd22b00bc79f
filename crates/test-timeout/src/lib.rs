//! Watchdog attributes for tests that talk to sockets or child processes.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test, `#[test_timeout::tokio_timeout_test]`
//! wraps an async one in its own Tokio runtime. Both run the body on a separate thread and
//! fail the test when it outlives the deadline instead of hanging the suite.
//!
//! Arguments: a bare integer (`#[timeout(5)]`) or `secs = 5`; the async form also takes
//! `flavor = "multi_thread"`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Expr, ExprLit, ItemFn, Lit, LitInt, MetaNameValue, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct TimeoutArgs {
    secs: u64,
    flavor: Flavor,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
        };
        if input.is_empty() {
            return Ok(args);
        }

        if input.peek(LitInt) {
            let lit: LitInt = input.parse()?;
            args.secs = parse_secs(&lit)?;
            return Ok(args);
        }

        let pairs = Punctuated::<MetaNameValue, Token![,]>::parse_terminated(input)?;
        for pair in pairs {
            let Some(ident) = pair.path.get_ident() else {
                return Err(syn::Error::new_spanned(&pair.path, "expected `secs` or `flavor`"));
            };
            match (ident.to_string().as_str(), &pair.value) {
                (
                    "secs",
                    Expr::Lit(ExprLit {
                        lit: Lit::Int(lit), ..
                    }),
                ) => args.secs = parse_secs(lit)?,
                (
                    "flavor",
                    Expr::Lit(ExprLit {
                        lit: Lit::Str(lit), ..
                    }),
                ) => {
                    args.flavor = match lit.value().as_str() {
                        "current_thread" => Flavor::CurrentThread,
                        "multi_thread" => Flavor::MultiThread,
                        other => {
                            return Err(syn::Error::new_spanned(
                                lit,
                                format!("unknown runtime flavor `{other}`"),
                            ))
                        }
                    }
                }
                _ => {
                    return Err(syn::Error::new_spanned(
                        &pair,
                        "expected `secs = <int>` or `flavor = \"current_thread\" | \"multi_thread\"`",
                    ))
                }
            }
        }
        Ok(args)
    }
}

fn parse_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_test_attributes(attrs);
    let secs = args.secs;
    let runtime = match args.flavor {
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
        Flavor::MultiThread => quote! { tokio::runtime::Builder::new_multi_thread() },
    };
    let body = quote! {
        let runtime = #runtime
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(std::time::Duration::from_secs(#secs), async move #block)
                .await
                .expect("test timed out")
        })
    };

    watchdog(attrs, vis, sig, secs, body).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    if args.flavor != Flavor::CurrentThread {
        return syn::Error::new_spanned(&sig.ident, "`flavor` only applies to async tests")
            .to_compile_error()
            .into();
    }

    let attrs = strip_test_attributes(attrs);
    let body = quote! { #block };
    watchdog(attrs, vis, sig, args.secs, body).into()
}

/// Emits a `#[test]` that runs `body` on a helper thread and waits at most `secs` for it.
/// The body's value is handed back, so tests may return a `Send` result type.
fn watchdog(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    secs: u64,
    body: TokenStream2,
) -> TokenStream2 {
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(deadline) {
                Ok(Ok(value)) => value,
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s watchdog", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    }
}

/// Drops `#[test]` and `#[tokio::test]` so the generated wrapper is the only test entry.
fn strip_test_attributes(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            !matches!(
                segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
                ["test"] | ["tokio", "test"]
            )
        })
        .collect()
}
