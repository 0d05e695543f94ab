//! Shared utilities for flightcache procedural macros
//!
//! This crate provides the attribute parsing, signature checks and code
//! generation used by both `flightcache-macros` and `flightcache-async-macros`.

use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    punctuated::Punctuated, Expr, FnArg, GenericArgument, Ident, Lit, MetaNameValue, Pat,
    PathArguments, ReturnType, Signature, Token, Type,
};

/// Where a cached function keeps its results
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Local,
    Remote,
}

/// Parsed `#[cached(..)]` / `#[cached_async(..)]` attributes
pub struct CacheAttributes {
    pub ttl: Option<TokenStream2>,
    pub never_die: bool,
    pub custom_name: Option<String>,
    pub ignore: Vec<String>,
    pub backend: Backend,
}

impl Default for CacheAttributes {
    fn default() -> Self {
        Self {
            ttl: None,
            never_die: false,
            custom_name: None,
            ignore: Vec::new(),
            backend: Backend::Local,
        }
    }
}

fn error(msg: &str) -> TokenStream2 {
    quote! { compile_error!(#msg) }
}

fn lit(nv: &MetaNameValue) -> Option<&Lit> {
    match &nv.value {
        Expr::Lit(expr_lit) => Some(&expr_lit.lit),
        _ => None,
    }
}

/// Parse `ttl = <seconds>` or `ttl_ms = <milliseconds>` into a `Duration` expression
pub fn parse_ttl_attribute(nv: &MetaNameValue, millis: bool) -> Result<TokenStream2, TokenStream2> {
    let name = if millis { "ttl_ms" } else { "ttl" };
    let val = match lit(nv) {
        Some(Lit::Int(lit_int)) => lit_int.base10_parse::<u64>().map_err(|_| {
            error(&format!("Invalid value for `{}`: expected a positive integer", name))
        })?,
        _ => {
            return Err(error(&format!(
                "Invalid syntax for `{}`: expected `{} = <integer>`",
                name, name
            )))
        }
    };
    if val == 0 {
        return Err(error(&format!("`{}` must be greater than zero", name)));
    }
    Ok(if millis {
        quote! { ::std::time::Duration::from_millis(#val) }
    } else {
        quote! { ::std::time::Duration::from_secs(#val) }
    })
}

/// Parse the `never_die` attribute
pub fn parse_never_die_attribute(nv: &MetaNameValue) -> Result<bool, TokenStream2> {
    match lit(nv) {
        Some(Lit::Bool(b)) => Ok(b.value),
        _ => Err(error(
            "Invalid syntax for `never_die`: expected `never_die = true|false`",
        )),
    }
}

/// Parse the `name` attribute
pub fn parse_name_attribute(nv: &MetaNameValue) -> Result<String, TokenStream2> {
    match lit(nv) {
        Some(Lit::Str(s)) if !s.value().is_empty() => Ok(s.value()),
        _ => Err(error(
            "Invalid syntax for `name`: expected a non-empty string",
        )),
    }
}

/// Parse `ignore = ["a", "b"]`
pub fn parse_ignore_attribute(nv: &MetaNameValue) -> Result<Vec<String>, TokenStream2> {
    let invalid = || error("Invalid syntax for `ignore`: expected `ignore = [\"arg\", ..]`");
    let Expr::Array(array) = &nv.value else {
        return Err(invalid());
    };
    array
        .elems
        .iter()
        .map(|elem| match elem {
            Expr::Lit(expr_lit) => match &expr_lit.lit {
                Lit::Str(s) => Ok(s.value()),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        })
        .collect()
}

/// Parse the `backend` attribute
pub fn parse_backend_attribute(nv: &MetaNameValue) -> Result<Backend, TokenStream2> {
    match lit(nv) {
        Some(Lit::Str(s)) => match s.value().as_str() {
            "local" => Ok(Backend::Local),
            "remote" => Ok(Backend::Remote),
            _ => Err(error(
                "Invalid backend: expected \"local\" or \"remote\"",
            )),
        },
        _ => Err(error(
            "Invalid syntax for `backend`: expected `backend = \"local\"|\"remote\"`",
        )),
    }
}

/// Parse cache attributes from a token stream
pub fn parse_attributes(attr: TokenStream2) -> Result<CacheAttributes, TokenStream2> {
    use syn::parse::Parser;

    let parser = Punctuated::<MetaNameValue, Token![,]>::parse_terminated;
    let parsed_args = parser.parse2(attr).map_err(|e| {
        let msg = format!("Failed to parse attributes: {}", e);
        quote! { compile_error!(#msg) }
    })?;

    let mut attrs = CacheAttributes::default();

    for nv in parsed_args {
        if nv.path.is_ident("ttl") {
            attrs.ttl = Some(parse_ttl_attribute(&nv, false)?);
        } else if nv.path.is_ident("ttl_ms") {
            attrs.ttl = Some(parse_ttl_attribute(&nv, true)?);
        } else if nv.path.is_ident("never_die") {
            attrs.never_die = parse_never_die_attribute(&nv)?;
        } else if nv.path.is_ident("name") {
            attrs.custom_name = Some(parse_name_attribute(&nv)?);
        } else if nv.path.is_ident("ignore") {
            attrs.ignore = parse_ignore_attribute(&nv)?;
        } else if nv.path.is_ident("backend") {
            attrs.backend = parse_backend_attribute(&nv)?;
        } else {
            let path = &nv.path;
            let name = quote!(#path).to_string().replace(' ', "");
            return Err(error(&format!(
                "Unknown attribute `{}`: expected ttl, ttl_ms, never_die, name, ignore or backend",
                name
            )));
        }
    }

    if attrs.ttl.is_none() {
        return Err(error("Missing `ttl`: expected `ttl = <seconds>` or `ttl_ms = <millis>`"));
    }

    Ok(attrs)
}

/// One parameter of a cached function
pub struct CachedArg {
    pub ident: Ident,
    pub ty: Type,
    pub keyed: bool,
}

/// The parts of a cached function's signature the generated code needs
pub struct CachedSignature {
    pub args: Vec<CachedArg>,
    pub value_ty: Type,
    pub err_ty: Type,
}

impl CachedSignature {
    /// Checks that `sig` is a free function with owned, named parameters
    /// returning `Result<T, E>`.
    pub fn analyze(sig: &Signature, ignore: &[String]) -> Result<Self, TokenStream2> {
        if !sig.generics.params.is_empty() || sig.generics.where_clause.is_some() {
            return Err(error("cached functions cannot be generic"));
        }

        let mut args = Vec::new();
        for arg in sig.inputs.iter() {
            let pat_type = match arg {
                FnArg::Receiver(_) => {
                    return Err(error(
                        "cached functions cannot take `self`; wrap a free function instead",
                    ))
                }
                FnArg::Typed(pat_type) => pat_type,
            };
            let Pat::Ident(pat_ident) = pat_type.pat.as_ref() else {
                return Err(error("cached function parameters must be plain identifiers"));
            };
            match pat_type.ty.as_ref() {
                Type::Reference(_) => {
                    return Err(error(
                        "cached function parameters must be owned values, not references",
                    ))
                }
                Type::ImplTrait(_) => {
                    return Err(error("cached function parameters cannot be `impl Trait`"))
                }
                _ => {}
            }
            let ident = pat_ident.ident.clone();
            let keyed = !ignore.iter().any(|name| ident == name);
            args.push(CachedArg {
                ident,
                ty: pat_type.ty.as_ref().clone(),
                keyed,
            });
        }

        for name in ignore {
            if !args.iter().any(|arg| arg.ident == name) {
                return Err(error(&format!("`ignore` names unknown parameter `{}`", name)));
            }
        }

        let (value_ty, err_ty) = result_types(&sig.output).ok_or_else(|| {
            error("cached functions must return `Result<T, E>` with `E: From<CacheError>`")
        })?;

        Ok(Self {
            args,
            value_ty,
            err_ty,
        })
    }

    /// The tuple type the engine sees as the function's arguments
    pub fn args_type(&self) -> TokenStream2 {
        let tys = self.args.iter().map(|arg| &arg.ty);
        quote! { ( #(#tys,)* ) }
    }

    /// A tuple pattern / expression of the parameter names
    pub fn args_tuple(&self) -> TokenStream2 {
        let idents = self.args.iter().map(|arg| &arg.ident);
        quote! { ( #(#idents,)* ) }
    }

    pub fn arg_idents(&self) -> Vec<&Ident> {
        self.args.iter().map(|arg| &arg.ident).collect()
    }

    /// Key function: keyword arguments by parameter name, ignored ones left out
    pub fn key_fn(&self) -> TokenStream2 {
        let pattern = self.args_tuple();
        let args_ty = self.args_type();
        let kwargs = self.args.iter().filter(|arg| arg.keyed).map(|arg| {
            let ident = &arg.ident;
            let name = ident.to_string();
            quote! { .kwarg(#name, #ident)? }
        });
        let unused = self.args.iter().filter(|arg| !arg.keyed).map(|arg| &arg.ident);
        quote! {
            |#pattern: &#args_ty| {
                #( let _ = #unused; )*
                ::std::result::Result::Ok(::flightcache_core::Args::new() #(#kwargs)*)
            }
        }
    }
}

/// Splits `Result<T, E>` (under any path ending in `Result`) into `T` and `E`
fn result_types(output: &ReturnType) -> Option<(Type, Type)> {
    let ReturnType::Type(_, ty) = output else {
        return None;
    };
    let Type::Path(type_path) = ty.as_ref() else {
        return None;
    };
    let segment = type_path.path.segments.last()?;
    if segment.ident != "Result" {
        return None;
    }
    let PathArguments::AngleBracketed(generics) = &segment.arguments else {
        return None;
    };
    let mut types = generics.args.iter().filter_map(|arg| match arg {
        GenericArgument::Type(ty) => Some(ty.clone()),
        _ => None,
    });
    let value_ty = types.next()?;
    let err_ty = types.next()?;
    if types.next().is_some() {
        return None;
    }
    Some((value_ty, err_ty))
}

/// Expression for the function id: the custom name, or `module::fn`
pub fn function_id_expr(attrs: &CacheAttributes, ident: &Ident) -> TokenStream2 {
    match &attrs.custom_name {
        Some(name) => quote! { #name },
        None => {
            let name = ident.to_string();
            quote! { ::flightcache_core::function_id(module_path!(), #name) }
        }
    }
}

/// Expression building the `CacheOptions` of a cached function
pub fn options_expr(attrs: &CacheAttributes, shape: &CachedSignature) -> TokenStream2 {
    let ttl = attrs
        .ttl
        .clone()
        .unwrap_or_else(|| error("Missing `ttl`"));
    let never_die = attrs.never_die;
    let args_ty = shape.args_type();
    let key_fn = shape.key_fn();
    quote! {
        ::flightcache_core::CacheOptions::<#args_ty>::with_key_fn(#ttl, #key_fn)
            .never_die(#never_die)
    }
}

/// Name of the generated `<name>_with(.., CallOptions)` companion
pub fn with_ident(ident: &Ident) -> Ident {
    format_ident!("{}_with", ident)
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::ItemFn;

    fn sig(src: &str) -> Signature {
        syn::parse_str::<ItemFn>(src).unwrap().sig
    }

    #[test]
    fn test_parse_full_attributes() {
        let attrs = parse_attributes(quote! {
            ttl = 60, never_die = true, name = "users", ignore = ["trace"], backend = "remote"
        })
        .unwrap_or_else(|_| panic!("attributes should parse"));

        assert!(attrs.ttl.is_some());
        assert!(attrs.never_die);
        assert_eq!(attrs.custom_name.as_deref(), Some("users"));
        assert_eq!(attrs.ignore, vec!["trace".to_string()]);
        assert_eq!(attrs.backend, Backend::Remote);
    }

    #[test]
    fn test_ttl_is_required_and_positive() {
        assert!(parse_attributes(quote! { never_die = true }).is_err());
        assert!(parse_attributes(quote! { ttl = 0 }).is_err());
        assert!(parse_attributes(quote! { ttl_ms = 250 }).is_ok());
    }

    #[test]
    fn test_unknown_attribute_is_rejected() {
        assert!(parse_attributes(quote! { ttl = 1, limit = 10 }).is_err());
        assert!(parse_attributes(quote! { ttl = 1, backend = "disk" }).is_err());
    }

    #[test]
    fn test_analyze_splits_result() {
        let shape = CachedSignature::analyze(
            &sig("fn f(a: u32, trace: String) -> Result<Vec<u8>, anyhow::Error> { todo!() }"),
            &["trace".to_string()],
        )
        .unwrap_or_else(|_| panic!("signature should be accepted"));

        assert_eq!(shape.args.len(), 2);
        assert!(shape.args[0].keyed);
        assert!(!shape.args[1].keyed);
        let value_ty = &shape.value_ty;
        assert_eq!(quote!(#value_ty).to_string(), quote!(Vec<u8>).to_string());
    }

    #[test]
    fn test_analyze_rejects_unsupported_shapes() {
        let no_ignore: &[String] = &[];
        for src in [
            "fn f(&self) -> Result<u8, E> { todo!() }",
            "fn f(a: &str) -> Result<u8, E> { todo!() }",
            "fn f<T>(a: T) -> Result<u8, E> { todo!() }",
            "fn f(a: u8) -> u8 { todo!() }",
            "fn f((a, b): (u8, u8)) -> Result<u8, E> { todo!() }",
        ] {
            assert!(CachedSignature::analyze(&sig(src), no_ignore).is_err(), "{}", src);
        }
        assert!(CachedSignature::analyze(
            &sig("fn f(a: u8) -> Result<u8, E> { todo!() }"),
            &["b".to_string()]
        )
        .is_err());
    }
}
