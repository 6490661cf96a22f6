// These lints are triggered by darling's generated code for
// `#[darling(default)]`.
#![allow(clippy::option_if_let_else)]
#![allow(clippy::needless_continue)]

use darling::{
    FromDeriveInput, FromField, FromMeta,
    ast::Data,
    util::{Ignored, PathList},
};
use heck::{ToKebabCase, ToUpperCamelCase};
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, quote};
use syn::{DeriveInput, Ident, Path, parse_macro_input};

#[allow(clippy::doc_markdown, reason = "false positive")]
/// Build a PascalCase enum variant name from a type path.
fn path_to_pascal_ident(path: &Path) -> Ident {
    let combined = path
        .segments
        .iter()
        .map(|s| s.ident.to_string())
        .collect::<Vec<_>>()
        .join("_");
    let pascal = combined.to_upper_camel_case();
    let span = path
        .segments
        .last()
        .map_or_else(proc_macro2::Span::call_site, |segment| segment.ident.span());
    Ident::new(&pascal, span)
}

/// Returns the kind override or the default kebab-case name from the ident.
fn default_kind(ident: &Ident, kind: Option<String>) -> String {
    kind.unwrap_or_else(|| ident.to_string().to_kebab_case())
}

/// Wrapper for `syn::Type` that parses from `key = Type` syntax.
#[derive(Debug, Clone)]
struct TypeExpr(syn::Type);

impl FromMeta for TypeExpr {
    fn from_meta(item: &syn::Meta) -> darling::Result<Self> {
        let error = || darling::Error::unsupported_shape("expected `key = Type`");
        let syn::Meta::NameValue(nv) = item else {
            return Err(error());
        };
        syn::parse2(nv.value.to_token_stream())
            .map(Self)
            .map_err(|_| error())
    }
}

/// A named field, possibly marked `#[aggregate(root)]`.
#[derive(Debug, FromField)]
#[darling(attributes(aggregate))]
struct AggregateField {
    ident: Option<Ident>,
    #[darling(default)]
    root: bool,
}

/// Configuration for the `#[aggregate(...)]` attribute.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(aggregate), supports(struct_named))]
struct AggregateArgs {
    ident: Ident,
    vis: syn::Visibility,
    data: Data<Ignored, AggregateField>,
    events: PathList,
    #[darling(default)]
    kind: Option<String>,
    #[darling(default)]
    event_enum: Option<String>,
    #[darling(default)]
    derives: Option<PathList>,
    /// Snapshot state type. The aggregate must implement `Snapshotting`.
    #[darling(default)]
    snapshot: Option<TypeExpr>,
}

/// Captures the event type path and its generated enum variant identifier.
struct EventSpec<'a> {
    path: &'a Path,
    variant: Ident,
}

impl<'a> EventSpec<'a> {
    fn new(path: &'a Path) -> Self {
        Self {
            path,
            variant: path_to_pascal_ident(path),
        }
    }
}

/// Parse derive input with darling and render errors as tokens.
fn parse_or_error<T, F>(input: &DeriveInput, f: F) -> TokenStream2
where
    T: FromDeriveInput,
    F: FnOnce(T) -> TokenStream2,
{
    match T::from_derive_input(input) {
        Ok(args) => f(args),
        Err(err) => err.write_errors(),
    }
}

/// The single field marked `#[aggregate(root)]`.
fn root_field(args: &AggregateArgs) -> darling::Result<&Ident> {
    let fields = args
        .data
        .as_ref()
        .take_struct()
        .ok_or_else(|| darling::Error::unsupported_shape("expected a struct with named fields"))?;

    let mut roots = fields.fields.into_iter().filter(|field| field.root);
    match (roots.next(), roots.next()) {
        (Some(field), None) => field
            .ident
            .as_ref()
            .ok_or_else(|| darling::Error::custom("the root field must be named")),
        (None, _) => Err(darling::Error::custom(
            "exactly one field must be marked `#[aggregate(root)]`",
        )
        .with_span(&args.ident)),
        (Some(_), Some(second)) => Err(darling::Error::custom(
            "only one field may be marked `#[aggregate(root)]`",
        )
        .with_span(second.ident.as_ref().unwrap_or(&args.ident))),
    }
}

/// Derives the `Aggregate` trait for a struct.
///
/// This macro generates:
/// - An event enum containing all aggregate event types
/// - `EventKind`, `Serialize` and `DecodeEvent` for the enum
/// - `From<E>` and `Variant<E>` for each event type
/// - `Aggregate` for the struct, whose handler registry routes each event to
///   its `Apply<E>` implementation
///
/// The struct must implement `Default` and hold exactly one `Root<Self>`
/// field marked `#[aggregate(root)]`.
///
/// # Attributes
///
/// ## Required
/// - `events(Type1, Type2, ...)` - Event types
///
/// ## Optional
/// - `kind = "name"` - Aggregate type identifier (default: kebab-case struct
///   name)
/// - `event_enum = "Name"` - Override generated event enum name (default:
///   `{Struct}Event`)
/// - `derives(Trait1, Trait2, ...)` - Additional derives for the generated
///   event enum. Always includes `Clone`. Common additions: `Debug`,
///   `PartialEq`, `Eq`
/// - `snapshot = Type` - Enable snapshots with this state type. The struct
///   must implement `Snapshotting`.
///
/// # Example
///
/// ```ignore
/// #[derive(Default, Aggregate)]
/// #[aggregate(events(GiftcardCreated, GiftcardRedeemed), derives(Debug, PartialEq))]
/// pub struct Giftcard {
///     #[aggregate(root)]
///     root: Root<Self>,
///     balance: i64,
/// }
/// ```
#[proc_macro_derive(Aggregate, attributes(aggregate))]
pub fn derive_aggregate(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_aggregate_impl(&input).into()
}

/// Internal entry point that returns tokens for the aggregate derive.
fn derive_aggregate_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error::<AggregateArgs, _>(input, |args| generate_aggregate_impl(args, input))
}

/// Generate the aggregate derive implementation tokens.
#[allow(clippy::too_many_lines)]
fn generate_aggregate_impl(args: AggregateArgs, input: &DeriveInput) -> TokenStream2 {
    let event_specs: Vec<EventSpec<'_>> = args.events.iter().map(EventSpec::new).collect();

    if event_specs.is_empty() {
        return darling::Error::custom("events(...) must contain at least one event type")
            .with_span(&input.ident)
            .write_errors();
    }

    let root = match root_field(&args) {
        Ok(root) => root,
        Err(err) => return err.write_errors(),
    };

    let struct_name = &args.ident;
    let struct_vis = &args.vis;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let kind = default_kind(struct_name, args.kind.clone());

    let event_enum_name = args.event_enum.as_ref().map_or_else(
        || Ident::new(&format!("{struct_name}Event"), struct_name.span()),
        |name| Ident::new(name, struct_name.span()),
    );

    let event_types: Vec<&Path> = event_specs.iter().map(|spec| spec.path).collect();
    let variant_names: Vec<&Ident> = event_specs.iter().map(|spec| &spec.variant).collect();

    // Build derives list - always include Clone, add user-specified traits
    let user_derives = args.derives.clone().unwrap_or_default();
    let derives = quote! { #[derive(Clone, #(#user_derives),*)] };

    let snapshot_items = match &args.snapshot {
        Some(TypeExpr(state)) => quote! {
            type Snapshot = #state;

            fn create_snapshot(&self) -> ::core::option::Option<Self::Snapshot> {
                ::core::option::Option::Some(
                    <Self as ::eventide::aggregate::Snapshotting>::snapshot_state(self),
                )
            }

            fn load_from_snapshot(&mut self, state: Self::Snapshot) {
                <Self as ::eventide::aggregate::Snapshotting>::restore_state(self, state);
            }
        },
        None => quote! {
            type Snapshot = ();
        },
    };

    quote! {
        #[doc = concat!("Event type for the [`", stringify!(#struct_name), "`] aggregate.")]
        #derives
        #struct_vis enum #event_enum_name {
            #(
                #[doc = concat!("[`", stringify!(#event_types), "`]")]
                #variant_names(#event_types)
            ),*
        }

        impl ::eventide::event::EventKind for #event_enum_name {
            fn kind(&self) -> &'static str {
                match self {
                    #(Self::#variant_names(_) => <#event_types as ::eventide::event::DomainEvent>::KIND),*
                }
            }
        }

        impl ::serde::Serialize for #event_enum_name {
            fn serialize<S>(&self, serializer: S) -> ::core::result::Result<S::Ok, S::Error>
            where
                S: ::serde::Serializer,
            {
                match self {
                    #(Self::#variant_names(inner) => ::serde::Serialize::serialize(inner, serializer)),*
                }
            }
        }

        impl ::eventide::event::DecodeEvent for #event_enum_name {
            fn decode<C: ::eventide::codec::Codec>(
                kind: &str,
                data: &[u8],
                codec: &C,
            ) -> ::core::result::Result<::core::option::Option<Self>, C::Error> {
                #(
                    if kind == <#event_types as ::eventide::event::DomainEvent>::KIND {
                        return codec
                            .deserialize::<#event_types>(data)
                            .map(|event| ::core::option::Option::Some(Self::#variant_names(event)));
                    }
                )*
                ::core::result::Result::Ok(::core::option::Option::None)
            }
        }

        #(
            impl ::core::convert::From<#event_types> for #event_enum_name {
                fn from(event: #event_types) -> Self {
                    Self::#variant_names(event)
                }
            }

            impl ::eventide::event::Variant<#event_types> for #event_enum_name {
                fn variant(&self) -> ::core::option::Option<&#event_types> {
                    match self {
                        Self::#variant_names(event) => ::core::option::Option::Some(event),
                        #[allow(unreachable_patterns)]
                        _ => ::core::option::Option::None,
                    }
                }
            }
        )*

        impl #impl_generics ::eventide::Aggregate for #struct_name #ty_generics #where_clause {
            const KIND: &'static str = #kind;
            type Event = #event_enum_name;
            #snapshot_items

            fn empty(id: ::std::string::String) -> Self {
                let transitions = ::eventide::aggregate::Transitions::new()
                    #(.on::<#event_types>(<Self as ::eventide::aggregate::Apply<#event_types>>::apply))*;
                Self {
                    #root: ::eventide::aggregate::Root::new(id, transitions),
                    ..::core::default::Default::default()
                }
            }

            fn root(&self) -> &::eventide::aggregate::Root<Self> {
                &self.#root
            }

            fn root_mut(&mut self) -> &mut ::eventide::aggregate::Root<Self> {
                &mut self.#root
            }
        }
    }
}
