use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, ItemFn};

// Import shared utilities from flightcache-macro-utils
use flightcache_macro_utils::{
    function_id_expr, options_expr, parse_attributes, with_ident, Backend, CacheAttributes,
    CachedSignature,
};

fn generate_engine_expr(backend: Backend, value_ty: &syn::Type) -> TokenStream2 {
    match backend {
        Backend::Local => quote! {
            ::flightcache_core::AsyncCacheEngine::<#value_ty>::local()
        },
        Backend::Remote => quote! {
            ::flightcache_core::AsyncCacheEngine::<#value_ty>::remote(
                ::flightcache_core::remote::remote_config()?,
            )?
        },
    }
}

fn expand(attrs: CacheAttributes, input: ItemFn) -> Result<TokenStream2, TokenStream2> {
    if input.sig.asyncness.is_none() {
        return Err(quote! {
            compile_error!("`#[cached_async]` requires an `async fn`; use `#[cached]` for sync functions")
        });
    }

    let shape = CachedSignature::analyze(&input.sig, &attrs.ignore)?;

    let fn_attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let ident = &sig.ident;
    let inputs: Vec<_> = sig.inputs.iter().collect();
    let output = &sig.output;
    let block = &input.block;

    let with_ident = with_ident(ident);
    let with_doc = format!(
        "[`{}`] with per-call [`CallOptions`](::flightcache_core::CallOptions).",
        ident
    );

    let value_ty = &shape.value_ty;
    let err_ty = &shape.err_ty;
    let args_ty = shape.args_type();
    let tuple = shape.args_tuple();
    let idents = shape.arg_idents();

    let engine_expr = generate_engine_expr(attrs.backend, value_ty);
    let fn_id = function_id_expr(&attrs, ident);
    let options = options_expr(&attrs, &shape);

    Ok(quote! {
        #(#fn_attrs)*
        #vis async fn #ident(#(#inputs),*) #output {
            #with_ident(#(#idents,)* ::flightcache_core::CallOptions::default()).await
        }

        #[doc = #with_doc]
        #vis async fn #with_ident(
            #(#inputs,)*
            __call: ::flightcache_core::CallOptions,
        ) #output {
            async fn __compute(#(#inputs),*) #output #block

            type __Args = #args_ty;

            static __CACHED: ::flightcache_core::__private::OnceCell<
                ::flightcache_core::AsyncCachedFn<__Args, #value_ty, #err_ty>,
            > = ::flightcache_core::__private::OnceCell::new();

            let __cached = match __CACHED.get_or_try_init(
                || -> ::std::result::Result<_, ::flightcache_core::CacheError> {
                    let __engine = #engine_expr;
                    __engine.wrap(#fn_id, #options, |#tuple: __Args| {
                        __compute(#(#idents),*)
                    })
                },
            ) {
                ::std::result::Result::Ok(cached) => cached,
                ::std::result::Result::Err(err) => {
                    return ::std::result::Result::Err(::std::convert::From::from(err))
                }
            };

            __cached
                .call_with(#tuple, __call)
                .await
                .map_err(::flightcache_core::CallError::flatten)
        }
    })
}

/// Caches the results of an async function returning `Result<T, E>`.
///
/// The async counterpart of `#[cached]`: the function is wrapped once, on
/// first call, by an `AsyncCacheEngine`. Concurrent calls with the same
/// arguments compute once while the others await the stored result, without
/// blocking the runtime. Errors are never cached, and dropping a call's
/// future releases its lock.
///
/// A companion `<name>_with(args.., CallOptions)` is generated for per-call
/// options such as `skip_cache`.
///
/// # Requirements
///
/// - **Function must be async**: declared with `async fn`, returning a `Send` future
/// - **Arguments**: owned values implementing `Clone + Serialize + Send + Sync`
/// - **Return type**: `Result<T, E>` where `T: Clone + Send + Sync` and
///   `E: Display + Send + From<CacheError>`
/// - **Runtime**: `never_die` refreshes run on the Tokio runtime of the first call
///
/// # Macro Parameters
///
/// - `ttl` / `ttl_ms` (required): lifetime of a result in seconds or milliseconds.
/// - `never_die` (optional): refresh results in the background at 90% of the TTL.
/// - `name` (optional): function id. Default: `module_path::fn_name`.
/// - `ignore` (optional): parameter names left out of the key.
/// - `backend` (optional): `"local"` (default) or `"remote"`.
///
/// # Examples
///
/// ```ignore
/// use flightcache_async::cached_async;
///
/// #[cached_async(ttl = 30)]
/// async fn fetch_user(id: u64) -> Result<User, anyhow::Error> {
///     let user = api::get_user(id).await?;
///     Ok(user)
/// }
///
/// #[cached_async(ttl = 600, never_die = true, backend = "remote")]
/// async fn exchange_rates(base: String) -> Result<Rates, anyhow::Error> {
///     rates::load(&base).await
/// }
///
/// let user = fetch_user(7).await?;
/// let fresh = fetch_user_with(7, flightcache_async::CallOptions::skip_cache()).await?;
/// ```
#[proc_macro_attribute]
pub fn cached_async(attr: TokenStream, item: TokenStream) -> TokenStream {
    let attrs = match parse_attributes(attr.into()) {
        Ok(attrs) => attrs,
        Err(err) => return err.into(),
    };
    let input = parse_macro_input!(item as ItemFn);

    match expand(attrs, input) {
        Ok(expanded) => expanded.into(),
        Err(err) => err.into(),
    }
}
