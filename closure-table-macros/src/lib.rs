use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::ext::IdentExt;
use syn::{parse_macro_input, spanned::Spanned, Attribute, Data, DeriveInput, Fields, Ident, Type};

#[proc_macro_derive(ClosureNode, attributes(closure_table))]
pub fn derive_closure_node(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match impl_closure_node(&input) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

#[derive(Default)]
struct Options {
    id_field: Option<String>,
    id_type: Option<Type>,
    parent_field: Option<String>,
    entity_name: Option<String>,
    closure_table: Option<String>,
    ancestor_column: Option<String>,
    descendant_column: Option<String>,
    distance_column: Option<String>,
    children_key: Option<String>,
    deletion_policy: Option<String>,
    soft_delete_column: Option<String>,
}

fn impl_closure_node(input: &DeriveInput) -> syn::Result<TokenStream> {
    let struct_ident = &input.ident;
    let span = struct_ident.span();

    let data_struct = match &input.data {
        Data::Struct(data) => data,
        _ => {
            return Err(syn::Error::new(
                input.span(),
                "ClosureNode can only be derived for structs",
            ))
        }
    };

    let mut options = Options::default();
    let mut table_name: Option<String> = None;

    for attr in &input.attrs {
        if attr.path().is_ident("closure_table") {
            parse_closure_table_attr(attr, &mut options)?;
        }

        if attr.path().is_ident("sea_orm") {
            if let Some(name) = parse_sea_orm_table_name(attr)? {
                table_name = Some(name);
            }
        }
    }

    let id_field_name = options.id_field.unwrap_or_else(|| "id".to_string());
    let parent_field_name = options
        .parent_field
        .unwrap_or_else(|| "parent".to_string());

    let id_field_ident = Ident::new(&id_field_name, span);
    let parent_field_ident = Ident::new(&parent_field_name, span);

    let mut id_field_type: Option<Type> = options.id_type.clone();
    let mut has_parent_field = false;

    if let Fields::Named(ref fields) = data_struct.fields {
        for field in &fields.named {
            if let Some(ident) = &field.ident {
                if ident == &id_field_ident && id_field_type.is_none() {
                    id_field_type = Some(field.ty.clone());
                }
                if ident == &parent_field_ident {
                    has_parent_field = true;
                }
            }
        }
    } else {
        return Err(syn::Error::new(
            data_struct.fields.span(),
            "ClosureNode requires named fields",
        ));
    }

    let id_type = id_field_type.ok_or_else(|| {
        syn::Error::new(
            span,
            "Unable to determine id field type; specify `id_type = ...` in #[closure_table]",
        )
    })?;

    if !has_parent_field {
        return Err(syn::Error::new(
            span,
            format!("Parent field `{parent_field_name}` not found; set `parent_field = ...` in #[closure_table]"),
        ));
    }

    let entity_table = table_name.unwrap_or_else(|| struct_ident.unraw().to_string());

    let id_column_variant = format_ident!("{}", to_pascal_case(&id_field_name));
    let parent_column_variant = format_ident!("{}", to_pascal_case(&parent_field_name));

    let entity_table_literal = syn::LitStr::new(&entity_table, span);
    let id_column_literal = syn::LitStr::new(&id_field_name, span);
    let parent_column_literal = syn::LitStr::new(&parent_field_name, span);

    let mut option_calls = Vec::new();
    let string_options = [
        ("entity_name", options.entity_name),
        ("closure_table", options.closure_table),
        ("ancestor_column", options.ancestor_column),
        ("descendant_column", options.descendant_column),
        ("distance_column", options.distance_column),
        ("children_key", options.children_key),
        ("soft_delete_column", options.soft_delete_column),
    ];
    for (method, value) in string_options {
        if let Some(value) = value {
            let method = format_ident!("{}", method);
            let literal = syn::LitStr::new(&value, span);
            option_calls.push(quote! { .#method(#literal) });
        }
    }
    if let Some(policy) = options.deletion_policy {
        let variant = match policy.as_str() {
            "reparent" | "reparent-children-to-root" => format_ident!("ReparentChildrenToRoot"),
            "cascade" | "cascade-subtree" => format_ident!("CascadeSubtree"),
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("Unsupported deletion_policy `{other}`; expected `reparent` or `cascade`"),
                ))
            }
        };
        option_calls.push(quote! {
            .deletion_policy(::closure_table::DeletionPolicy::#variant)
        });
    }

    let generated = quote! {
        impl ::closure_table::ClosureNode for #struct_ident {
            type Entity = Entity;
            type ActiveModel = ActiveModel;
            type Id = #id_type;

            fn closure_config() -> &'static ::closure_table::ClosureTableConfig {
                static CONFIG: ::closure_table::__private::Lazy<::closure_table::ClosureTableConfig> =
                    ::closure_table::__private::Lazy::new(|| {
                        let base = ::closure_table::ClosureTableConfig::new(#entity_table_literal);
                        ::closure_table::ClosureTableOptions::default()
                            .key_column(#id_column_literal)
                            .parent_column(#parent_column_literal)
                            #(#option_calls)*
                            .apply(base)
                    });
                &CONFIG
            }

            fn key(&self) -> Self::Id {
                self.#id_field_ident.clone()
            }

            fn parent_key(&self) -> Option<Self::Id> {
                self.#parent_field_ident.clone()
            }

            fn set_parent_key(active: &mut Self::ActiveModel, parent: Option<Self::Id>) {
                active.#parent_field_ident = ::sea_orm::ActiveValue::Set(parent);
            }

            fn key_column() -> <Self::Entity as ::sea_orm::EntityTrait>::Column {
                Column::#id_column_variant
            }

            fn parent_column() -> <Self::Entity as ::sea_orm::EntityTrait>::Column {
                Column::#parent_column_variant
            }
        }
    };

    Ok(generated.into())
}

fn parse_closure_table_attr(attr: &Attribute, options: &mut Options) -> syn::Result<()> {
    attr.parse_nested_meta(|meta| {
        let ident = meta
            .path
            .get_ident()
            .ok_or_else(|| syn::Error::new(meta.path.span(), "Invalid option key"))?
            .to_string();

        if ident == "id_type" {
            let ty: Type = meta.value()?.parse()?;
            options.id_type = Some(ty);
            return Ok(());
        }

        let slot = match ident.as_str() {
            "id_field" => &mut options.id_field,
            "parent_field" => &mut options.parent_field,
            "entity_name" => &mut options.entity_name,
            "closure_table" => &mut options.closure_table,
            "ancestor_column" => &mut options.ancestor_column,
            "descendant_column" => &mut options.descendant_column,
            "distance_column" => &mut options.distance_column,
            "children_key" => &mut options.children_key,
            "deletion_policy" => &mut options.deletion_policy,
            "soft_delete_column" => &mut options.soft_delete_column,
            other => {
                return Err(syn::Error::new(
                    meta.path.span(),
                    format!("Unsupported closure_table option `{other}`"),
                ));
            }
        };
        let value: syn::LitStr = meta.value()?.parse()?;
        *slot = Some(value.value());

        Ok(())
    })
}

fn parse_sea_orm_table_name(attr: &Attribute) -> syn::Result<Option<String>> {
    let mut table_name: Option<String> = None;
    attr.parse_nested_meta(|meta| {
        if meta.path.is_ident("table_name") {
            let value: syn::LitStr = meta.value()?.parse()?;
            table_name = Some(value.value());
        } else if meta.input.peek(syn::Token![=]) {
            // Skip other `key = value` options such as `schema_name`.
            let _: syn::Expr = meta.value()?.parse()?;
        }
        Ok(())
    })?;
    Ok(table_name)
}

fn to_pascal_case(value: &str) -> String {
    value
        .split('_')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}
