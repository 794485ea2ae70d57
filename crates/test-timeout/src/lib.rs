use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt, LitStr, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Fails a blocking test after a deadline, 30 seconds unless given: `#[test_timeout::timeout(5)]`.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = if attr.is_empty() {
        DEFAULT_TIMEOUT_SECS
    } else {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse::<u64>() {
            Ok(0) => {
                return syn::Error::new_spanned(lit, "timeout must be greater than zero")
                    .to_compile_error()
                    .into();
            }
            Ok(secs) => secs,
            Err(err) => return err.to_compile_error().into(),
        }
    };

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !attr.path().is_ident("test"))
        .collect();
    let thread_name = LitStr::new(&sig.ident.to_string(), Span::call_site());

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(#thread_name.to_string())
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #block));
                    let _ = sender.send(outcome);
                })
                .expect("spawn test thread");
            match receiver.recv_timeout(deadline) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} did not finish within {:?}", #thread_name, deadline)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} exited without reporting a result", #thread_name)
                }
            }
        }
    })
}
