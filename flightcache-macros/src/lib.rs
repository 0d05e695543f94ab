use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, ItemFn};

// Import shared utilities
use flightcache_macro_utils::{
    function_id_expr, options_expr, parse_attributes, with_ident, Backend, CacheAttributes,
    CachedSignature,
};

/// Generate the expression that builds the function's engine
fn generate_engine_expr(backend: Backend, value_ty: &syn::Type) -> TokenStream2 {
    match backend {
        Backend::Local => quote! {
            ::flightcache_core::CacheEngine::<#value_ty>::local()
        },
        Backend::Remote => quote! {
            ::flightcache_core::CacheEngine::<#value_ty>::remote(
                ::flightcache_core::remote::remote_config()?,
            )?
        },
    }
}

fn expand(attrs: CacheAttributes, input: ItemFn) -> Result<TokenStream2, TokenStream2> {
    if input.sig.asyncness.is_some() {
        return Err(quote! {
            compile_error!("`#[cached]` does not support async functions; use `#[cached_async]`")
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
        #vis fn #ident(#(#inputs),*) #output {
            #with_ident(#(#idents,)* ::flightcache_core::CallOptions::default())
        }

        #[doc = #with_doc]
        #vis fn #with_ident(
            #(#inputs,)*
            __call: ::flightcache_core::CallOptions,
        ) #output {
            fn __compute(#(#inputs),*) #output #block

            type __Args = #args_ty;

            static __CACHED: ::flightcache_core::__private::OnceCell<
                ::flightcache_core::CachedFn<__Args, #value_ty, #err_ty>,
            > = ::flightcache_core::__private::OnceCell::new();

            let __cached = match __CACHED.get_or_try_init(
                || -> ::std::result::Result<_, ::flightcache_core::CacheError> {
                    let __engine = #engine_expr;
                    __engine.wrap(#fn_id, #options, |#tuple: &__Args| {
                        __compute(#(::std::clone::Clone::clone(#idents)),*)
                    })
                },
            ) {
                ::std::result::Result::Ok(cached) => cached,
                ::std::result::Result::Err(err) => {
                    return ::std::result::Result::Err(::std::convert::From::from(err))
                }
            };

            __cached
                .call_with(&#tuple, __call)
                .map_err(::flightcache_core::CallError::flatten)
        }
    })
}

/// Caches the results of a function returning `Result<T, E>`.
///
/// The function is wrapped once, on first call, by a `CacheEngine`. Concurrent
/// calls with the same arguments compute once; the others wait and read the
/// stored result. Errors are never cached.
///
/// A companion `<name>_with(args.., CallOptions)` is generated for per-call
/// options such as `skip_cache`.
///
/// # Requirements
///
/// - **Arguments**: owned values implementing `Clone + Serialize + Send + Sync`,
///   bound to plain identifiers. References, `impl Trait`, generics and
///   methods are rejected at compile time.
/// - **Return type**: `Result<T, E>` where `T: Clone + Send + Sync` (plus
///   `Serialize + DeserializeOwned` for the remote backend) and
///   `E: Display + From<CacheError>`. `anyhow::Error` qualifies.
///
/// # Macro Parameters
///
/// - `ttl` / `ttl_ms` (required): lifetime of a result in seconds or milliseconds.
/// - `never_die` (optional): refresh results in the background at 90% of the
///   TTL instead of letting them expire. Default: `false`.
/// - `name` (optional): function id used in keys and the statistics registry.
///   Default: `module_path::fn_name`.
/// - `ignore` (optional): parameter names left out of the key.
/// - `backend` (optional): `"local"` (default) or `"remote"`. The remote
///   backend reads the process-wide configuration set with
///   `flightcache_core::remote::configure_remote` on first call.
///
/// # Examples
///
/// ```ignore
/// use flightcache::cached;
///
/// #[cached(ttl = 60)]
/// fn user_name(id: u64) -> Result<String, anyhow::Error> {
///     Ok(db::load_user(id)?.name)
/// }
///
/// // Same key for any trace id
/// #[cached(ttl_ms = 500, ignore = ["trace_id"])]
/// fn quote(symbol: String, trace_id: String) -> Result<f64, anyhow::Error> {
///     prices::fetch(&symbol, &trace_id)
/// }
///
/// // Always recompute and overwrite the stored value
/// let fresh = user_name_with(7, flightcache::CallOptions::skip_cache())?;
/// ```
///
/// ## Never-Die with a Remote Store
///
/// ```ignore
/// use flightcache::cached;
///
/// #[cached(ttl = 300, never_die = true, backend = "remote", name = "pricing")]
/// fn price_table(region: String) -> Result<Vec<Price>, anyhow::Error> {
///     pricing::load(&region)
/// }
/// ```
#[proc_macro_attribute]
pub fn cached(attr: TokenStream, item: TokenStream) -> TokenStream {
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
