use convert_case::{Case, Casing};
use proc_macro::TokenStream;
use proc_macro2::{Ident, Span};
use quote::{format_ident, quote};
use syn::{
    parse_macro_input, parse_quote, FnArg, GenericArgument, ItemTrait, Pat, PathArguments,
    ReturnType, TraitItem, TraitItemFn, Type, TypeParamBound,
};

/*
Expansion for

    #[rpc_service]
    pub trait Calc: Send + Sync {
        async fn double(&self, request: Num) -> RpcResult<Num>;
    }

    pub struct CalcSchema;                      // names + RpcMethodInfo list
    impl RegisterService<CalcSchema> for RpcServiceWrapper<T> where T: Calc
                                                // "double" -> T::double
    impl<SF> Calc for RpcChannel<SF, CalcSchema>
                                                // remote proxy
    pub struct CalcClient<S: Calc>;             // call_double forwards to S
 */

struct RpcMethod {
    ident: Ident,
    arg: Ident,
    request: Type,
    output: Type,
    reply: Type,
}

#[proc_macro_attribute]
pub fn rpc_service(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return syn::Error::new(Span::call_site(), "rpc_service takes no arguments")
            .to_compile_error()
            .into();
    }
    let ast = parse_macro_input!(item as ItemTrait);
    expand(ast)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(mut ast: ItemTrait) -> syn::Result<proc_macro2::TokenStream> {
    if !ast.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &ast.generics,
            "rpc_service traits cannot be generic",
        ));
    }
    let mut methods = Vec::new();
    for item in ast.items.iter_mut() {
        let TraitItem::Fn(f) = item else {
            return Err(syn::Error::new_spanned(
                item,
                "rpc_service traits may only contain methods",
            ));
        };
        methods.push(parse_method(f)?);
        if f.sig.asyncness.take().is_some() {
            let output = &methods[methods.len() - 1].output;
            f.sig.output = parse_quote! {
                -> impl ::core::future::Future<Output = #output> + ::core::marker::Send
            };
        }
    }

    let vis = &ast.vis;
    let trait_ident = &ast.ident;
    let trait_name = trait_ident.to_string();
    let schema_ident = format_ident!("{}Schema", trait_ident);
    let client_ident = format_ident!("{}Client", trait_ident);

    let idents: Vec<_> = methods.iter().map(|m| &m.ident).collect();
    let args: Vec<_> = methods.iter().map(|m| &m.arg).collect();
    let requests: Vec<_> = methods.iter().map(|m| &m.request).collect();
    let outputs: Vec<_> = methods.iter().map(|m| &m.output).collect();
    let replies: Vec<_> = methods.iter().map(|m| &m.reply).collect();
    let wire_names: Vec<_> = methods
        .iter()
        .map(|m| m.ident.to_string().to_case(Case::Camel))
        .collect();
    let const_idents: Vec<_> = methods
        .iter()
        .map(|m| format_ident!("{}", m.ident.to_string().to_case(Case::UpperSnake)))
        .collect();
    let call_idents: Vec<_> = methods
        .iter()
        .map(|m| format_ident!("call_{}", m.ident))
        .collect();

    let schema = quote! {
        #[derive(Clone, Copy, Debug, Default)]
        #vis struct #schema_ident;

        impl #schema_ident {
            #(pub const #const_idents: &'static str = #wire_names;)*
        }

        impl bridge_rpc::RpcServiceSchema for #schema_ident {
            const NAME: &'static str = #trait_name;
            const METHODS: &'static [bridge_rpc::RpcMethodInfo] = &[
                #(bridge_rpc::RpcMethodInfo {
                    name: #wire_names,
                    request: stringify!(#requests),
                    response: stringify!(#replies),
                },)*
            ];
        }
    };

    let register = quote! {
        impl<T> bridge_rpc::RegisterService<#schema_ident> for bridge_rpc::RpcServiceWrapper<T>
        where
            T: #trait_ident + ::core::marker::Send + ::core::marker::Sync + 'static,
        {
            fn register<SF: bridge_rpc::formats::SerdeFormat>(
                self,
                __bridge_table: &mut bridge_rpc::MethodTable<SF>,
            ) {
                let __bridge_service = ::std::sync::Arc::new(self.service);
                #({
                    let __bridge_service = __bridge_service.clone();
                    __bridge_table.insert(#wire_names, move |#args: #requests| {
                        let __bridge_service = __bridge_service.clone();
                        async move { __bridge_service.#idents(#args).await }
                    });
                })*
            }
        }
    };

    let remote = quote! {
        impl<SF> #trait_ident for bridge_rpc::RpcChannel<SF, #schema_ident>
        where
            SF: bridge_rpc::formats::SerdeFormat,
        {
            #(fn #idents(
                &self,
                #args: #requests,
            ) -> impl ::core::future::Future<Output = #outputs> + ::core::marker::Send {
                self.call::<#requests, #replies>(#wire_names, &#args)
            })*
        }
    };

    let client = quote! {
        /// Calls the contract through any implementation, local or remote.
        #[derive(Clone, Debug, Default)]
        #vis struct #client_ident<S> {
            service: S,
        }

        impl<S: #trait_ident> #client_ident<S> {
            pub fn new(service: S) -> Self {
                Self { service }
            }

            pub fn service(&self) -> &S {
                &self.service
            }

            pub fn into_inner(self) -> S {
                self.service
            }

            #(pub async fn #call_idents(&self, #args: #requests) -> #outputs {
                self.service.#idents(#args).await
            })*
        }
    };

    Ok(quote! {
        #ast
        #schema
        #register
        #remote
        #client
    })
}

fn parse_method(f: &TraitItemFn) -> syn::Result<RpcMethod> {
    if f.default.is_some() {
        return Err(syn::Error::new_spanned(
            &f.sig,
            "rpc_service methods cannot have a default body",
        ));
    }
    match f.sig.receiver() {
        Some(receiver) if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => {
            return Err(syn::Error::new_spanned(
                &f.sig,
                "rpc_service methods must take `&self`",
            ));
        }
    }
    let typed: Vec<_> = f
        .sig
        .inputs
        .iter()
        .filter_map(|n| match n {
            FnArg::Typed(n) => Some(n),
            _ => None,
        })
        .collect();
    let [request] = typed.as_slice() else {
        return Err(syn::Error::new_spanned(
            &f.sig.inputs,
            "rpc_service methods take exactly one request argument",
        ));
    };
    let Pat::Ident(arg) = request.pat.as_ref() else {
        return Err(syn::Error::new_spanned(
            &request.pat,
            "request argument must be a plain identifier",
        ));
    };

    let output = match &f.sig.output {
        ReturnType::Type(_, ty) if f.sig.asyncness.is_some() => Some(*ty.clone()),
        ReturnType::Type(_, ty) => future_output(ty),
        ReturnType::Default => None,
    };
    let Some(output) = output else {
        return Err(syn::Error::new_spanned(
            &f.sig,
            "rpc_service methods must return `Result<Reply, RpcError>`",
        ));
    };
    let reply = ok_type(&output)?;

    Ok(RpcMethod {
        ident: f.sig.ident.clone(),
        arg: arg.ident.clone(),
        request: *request.ty.clone(),
        output,
        reply,
    })
}

/// `T` out of `impl Future<Output = T> + ...`.
fn future_output(ty: &Type) -> Option<Type> {
    let Type::ImplTrait(type_impl) = ty else {
        return None;
    };
    type_impl.bounds.iter().find_map(|n| match n {
        TypeParamBound::Trait(t) => {
            let x = t.path.segments.iter().find(|n| n.ident == "Future")?;
            let PathArguments::AngleBracketed(args) = &x.arguments else {
                return None;
            };
            args.args.iter().find_map(|n| match n {
                GenericArgument::AssocType(a) if a.ident == "Output" => Some(a.ty.clone()),
                _ => None,
            })
        }
        _ => None,
    })
}

/// `R` out of `Result<R, E>` or `RpcResult<R>`.
fn ok_type(ty: &Type) -> syn::Result<Type> {
    if let Type::Path(path) = ty {
        if let Some(segment) = path.path.segments.last() {
            if let PathArguments::AngleBracketed(args) = &segment.arguments {
                if let Some(GenericArgument::Type(ok)) = args.args.first() {
                    return Ok(ok.clone());
                }
            }
        }
    }
    Err(syn::Error::new_spanned(
        ty,
        "rpc_service methods must return `Result<Reply, RpcError>` or `RpcResult<Reply>`",
    ))
}
