use proc_macro::TokenStream;
use proc_macro_error::{abort, proc_macro_error};
use quote::{format_ident, quote};
use syn::{
    parse_macro_input, punctuated::Punctuated, Expr, FnArg, ItemFn, Lit, Meta, MetaNameValue,
    Pat, PatType, ReturnType, Token, Type,
};

const NAME: &str = "name";
const DEFAULTS: &str = "defaults";

/// What the generated handler has to do for one parameter
enum Param {
    /// Pulled from keyword arguments by name
    Value {
        name: String,
        ty: Type,
        default: Option<Expr>,
    },
    /// Receives the invocation context
    Context,
}

fn is_task_context(ty: &Type) -> bool {
    match ty {
        Type::Reference(reference) => match reference.elem.as_ref() {
            Type::Path(tp) => tp
                .path
                .segments
                .last()
                .map(|seg| seg.ident == "TaskContext")
                .unwrap_or(false),
            _ => false,
        },
        _ => false,
    }
}

fn returns_result(output: &ReturnType) -> bool {
    match output {
        ReturnType::Default => false,
        ReturnType::Type(_, ty) => match ty.as_ref() {
            Type::Path(tp) => tp
                .path
                .segments
                .last()
                .map(|seg| seg.ident == "Result")
                .unwrap_or(false),
            _ => false,
        },
    }
}

fn parse_defaults(meta: &Meta) -> Vec<(String, Expr)> {
    let list = match meta {
        Meta::List(list) => list,
        other => abort!(other, "Expected defaults(param = value, ...)"),
    };
    let pairs = list
        .parse_args_with(Punctuated::<MetaNameValue, Token![,]>::parse_terminated)
        .unwrap_or_else(|e| abort!(e.span(), "Failed to parse defaults: {}", e));
    pairs
        .into_iter()
        .map(|nv| {
            let key = nv
                .path
                .get_ident()
                .map(|ident| ident.to_string())
                .unwrap_or_else(|| abort!(nv.path, "Expected a parameter name"));
            (key, nv.value)
        })
        .collect()
}

/// Register a function as a task function.
///
/// # Attributes
/// - `name`: stable registry name (default: `module_path!()::fn_name`).
/// - `defaults(param = expr, ...)`: declared defaults, applied when a call
///   leaves the parameter unbound.
///
/// Parameters must be `serde::de::DeserializeOwned`, except one optional
/// `&TaskContext` parameter. The return value must be `serde::Serialize`;
/// a `Result` return maps `Err` to a failed task.
///
/// # Example
/// ```rust,ignore
/// #[task_fn(name = "math::scale", defaults(factor = 10))]
/// fn scale(total: i64, factor: i64) -> i64 {
///     total * factor
/// }
/// ```
#[proc_macro_attribute]
#[proc_macro_error]
pub fn task_fn(attr: TokenStream, item: TokenStream) -> TokenStream {
    let attr_args =
        syn::parse::Parser::parse2(Punctuated::<Meta, Token![,]>::parse_terminated, attr.into())
            .unwrap_or_else(|e| abort!(e.span(), "Failed to parse task_fn attributes: {}", e));

    let mut registered_name: Option<String> = None;
    let mut defaults: Vec<(String, Expr)> = Vec::new();

    for meta in &attr_args {
        if meta.path().is_ident(NAME) {
            if let Meta::NameValue(nv) = meta {
                if let Expr::Lit(expr_lit) = &nv.value {
                    if let Lit::Str(lit) = &expr_lit.lit {
                        registered_name = Some(lit.value());
                        continue;
                    }
                }
                abort!(nv.value, "Expected a string literal for name");
            }
            abort!(meta, "Expected name = \"...\"");
        } else if meta.path().is_ident(DEFAULTS) {
            defaults.extend(parse_defaults(meta));
        } else {
            abort!(meta, "Unknown task_fn attribute, expected `name` or `defaults`");
        }
    }

    let input = parse_macro_input!(item as ItemFn);
    let sig = &input.sig;
    let fn_name = &sig.ident;
    let fn_name_str = fn_name.to_string();
    let fn_vis = &input.vis;

    if sig.asyncness.is_some() {
        abort!(sig.asyncness, "task functions run on blocking threads and cannot be async");
    }
    if !sig.generics.params.is_empty() {
        abort!(sig.generics, "task functions cannot be generic");
    }

    let params: Vec<Param> = sig
        .inputs
        .iter()
        .map(|arg| match arg {
            FnArg::Receiver(receiver) => {
                abort!(receiver, "task functions cannot take self")
            }
            FnArg::Typed(PatType { pat, ty, .. }) => {
                if is_task_context(ty) {
                    return Param::Context;
                }
                if matches!(ty.as_ref(), Type::Reference(_)) {
                    abort!(ty, "Only &TaskContext may be taken by reference");
                }
                let name = match pat.as_ref() {
                    Pat::Ident(pat_ident) => pat_ident.ident.to_string(),
                    other => abort!(other, "Expected a plain parameter name"),
                };
                let default = defaults
                    .iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, expr)| expr.clone());
                Param::Value {
                    name,
                    ty: (**ty).clone(),
                    default,
                }
            }
        })
        .collect();

    for (key, expr) in &defaults {
        let known = params
            .iter()
            .any(|p| matches!(p, Param::Value { name, .. } if name == key));
        if !known {
            abort!(expr, "defaults names unknown parameter `{}`", key);
        }
    }

    let static_name = format_ident!("{}", fn_name_str.to_uppercase());
    let params_name = format_ident!("__CONVEYOR_PARAMS_{}", fn_name_str.to_uppercase());
    let handler_name = format_ident!("__conveyor_handler_{}", fn_name_str);

    let mut default_fns = Vec::new();
    let mut param_specs = Vec::new();
    let mut extractions = Vec::new();
    let mut call_args = Vec::new();

    for (index, param) in params.iter().enumerate() {
        let local = format_ident!("__arg{}", index);
        match param {
            Param::Context => {
                extractions.push(quote! { let #local = frame.context(); });
            }
            Param::Value { name, ty, default } => {
                let spec = match default {
                    Some(expr) => {
                        let default_fn =
                            format_ident!("__conveyor_default_{}_{}", fn_name_str, name);
                        default_fns.push(quote! {
                            #[doc(hidden)]
                            fn #default_fn() -> ::conveyor::__private::Value {
                                ::conveyor::__private::serde_json::json!(#expr)
                            }
                        });
                        quote! { ::conveyor::ParamSpec::with_default(#name, #default_fn) }
                    }
                    None => quote! { ::conveyor::ParamSpec::required(#name) },
                };
                param_specs.push(spec);
                extractions.push(quote! { let #local: #ty = frame.take(#name)?; });
            }
        }
        call_args.push(local);
    }

    let param_count = param_specs.len();
    let convert = if matches!(sig.output, ReturnType::Default) {
        quote! {
            #fn_name(#(#call_args),*);
            ::conveyor::__private::ok_value(())
        }
    } else if returns_result(&sig.output) {
        quote! { ::conveyor::__private::result_value(#fn_name(#(#call_args),*)) }
    } else {
        quote! { ::conveyor::__private::ok_value(#fn_name(#(#call_args),*)) }
    };

    let name_expr = match registered_name {
        Some(name) => quote! { #name },
        None => quote! { concat!(module_path!(), "::", #fn_name_str) },
    };

    let expanded = quote! {
        #input

        #(#default_fns)*

        #[doc(hidden)]
        static #params_name: [::conveyor::ParamSpec; #param_count] = [#(#param_specs),*];

        #[doc(hidden)]
        #[allow(unused_variables)]
        fn #handler_name(
            frame: &mut ::conveyor::CallFrame<'_>,
        ) -> ::core::result::Result<::conveyor::__private::Value, ::conveyor::TaskFailure> {
            #(#extractions)*
            #convert
        }

        #[::conveyor::__private::linkme::distributed_slice(::conveyor::TASK_FUNCTIONS)]
        #[linkme(crate = ::conveyor::__private::linkme)]
        #fn_vis static #static_name: ::conveyor::TaskFunction = ::conveyor::TaskFunction {
            name: #name_expr,
            params: &#params_name,
            handler: #handler_name,
        };
    };

    TokenStream::from(expanded)
}
