//! # Derive Layer
//! `Layer` can be derived for a struct composed of parameters and other layers.
//!
//! Field attributes:
//! - `#[layer(parameter)]`: a `ParameterD`.
//! - `#[layer(optional_parameter)]`: an `Option<ParameterD>`.
//! - `#[layer]` or `#[layer(layer)]`: a child layer, including `Vec<L>` and `Option<L>`.
//! - `name = "..."` may be added to any of the above to override the name used in
//!   `named_parameters()`. Tuple fields are named by their index.
//!
//! Fields without a `layer` attribute are skipped.
//!
//! Use `#[layer(crate)]` on the struct when deriving inside `cascaded_gaze` itself.
//!```ignore
//! use cascaded_gaze::{
//!     autograd::ParameterD,
//!     layer::{Conv2, Layer, LayerNorm2d},
//! };
//!
//! #[derive(Layer)]
//! struct Stem {
//!     #[layer]
//!     norm: LayerNorm2d,
//!     #[layer(name = "0")]
//!     conv: Conv2,
//!     #[layer(parameter)]
//!     scale: ParameterD,
//!     kind: &'static str,
//! }
//!```
//! Generates:
//!```ignore
//! # use cascaded_gaze::{autograd::ParameterD, layer::{self, Conv2, Layer, LayerNorm2d}, result::Result};
//! # struct Stem { norm: LayerNorm2d, conv: Conv2, scale: ParameterD }
//! impl Layer for Stem {
//!     fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
//!         Layer::collect_parameters(&self.norm, parameters);
//!         Layer::collect_parameters(&self.conv, parameters);
//!         parameters.push(self.scale.clone());
//!     }
//!     fn collect_parameters_mut<'layer>(&'layer mut self, parameters: &mut Vec<&'layer mut ParameterD>) {
//!         Layer::collect_parameters_mut(&mut self.norm, parameters);
//!         Layer::collect_parameters_mut(&mut self.conv, parameters);
//!         parameters.push(&mut self.scale);
//!     }
//!     fn collect_named_parameters(&self, prefix: &str, parameters: &mut Vec<(String, ParameterD)>) {
//!         Layer::collect_named_parameters(&self.norm, &layer::join_name(prefix, "norm"), parameters);
//!         Layer::collect_named_parameters(&self.conv, &layer::join_name(prefix, "0"), parameters);
//!         parameters.push((layer::join_name(prefix, "scale"), self.scale.clone()));
//!     }
//!     fn collect_named_parameters_mut<'layer>(
//!         &'layer mut self,
//!         prefix: &str,
//!         parameters: &mut Vec<(String, &'layer mut ParameterD)>,
//!     ) {
//!         Layer::collect_named_parameters_mut(&mut self.norm, &layer::join_name(prefix, "norm"), parameters);
//!         Layer::collect_named_parameters_mut(&mut self.conv, &layer::join_name(prefix, "0"), parameters);
//!         parameters.push((layer::join_name(prefix, "scale"), &mut self.scale));
//!     }
//!     fn set_training(&mut self, training: bool) -> Result<()> {
//!         Layer::set_training(&mut self.norm, training)?;
//!         Layer::set_training(&mut self.conv, training)?;
//!         self.scale.set_training(training);
//!         Ok(())
//!     }
//! }
//!```

use proc_macro::TokenStream as BaseTokenStream;
use proc_macro2::TokenStream;
use quote::{quote, ToTokens};
use syn::{
    parse_macro_input, spanned::Spanned, Attribute, Data, DeriveInput, Error, Fields, Index, Lit,
    Meta, NestedMeta, Result,
};

enum FieldKind {
    Parameter,
    OptionalParameter,
    Layer,
}

struct LayerField {
    member: TokenStream,
    name: String,
    kind: FieldKind,
}

fn is_layer_crate(attributes: &[Attribute]) -> bool {
    let krate = quote! {
        #[layer(crate)]
    };
    attributes
        .iter()
        .any(|attribute| attribute.to_token_stream().to_string() == krate.to_string())
}

fn parse_field_attributes(attributes: &[Attribute]) -> Result<Option<(FieldKind, Option<String>)>> {
    let mut output = None;
    for attribute in attributes.iter().filter(|x| x.path.is_ident("layer")) {
        let mut kind = FieldKind::Layer;
        let mut name = None;
        match attribute.parse_meta()? {
            Meta::Path(_) => (),
            Meta::List(list) => {
                for nested in list.nested.iter() {
                    match nested {
                        NestedMeta::Meta(Meta::Path(path)) if path.is_ident("parameter") => {
                            kind = FieldKind::Parameter;
                        }
                        NestedMeta::Meta(Meta::Path(path))
                            if path.is_ident("optional_parameter") =>
                        {
                            kind = FieldKind::OptionalParameter;
                        }
                        NestedMeta::Meta(Meta::Path(path)) if path.is_ident("layer") => {
                            kind = FieldKind::Layer;
                        }
                        NestedMeta::Meta(Meta::NameValue(name_value))
                            if name_value.path.is_ident("name") =>
                        {
                            if let Lit::Str(lit) = &name_value.lit {
                                name.replace(lit.value());
                            } else {
                                return Err(Error::new(
                                    name_value.lit.span(),
                                    "expected a string literal",
                                ));
                            }
                        }
                        _ => {
                            return Err(Error::new(
                                nested.span(),
                                "expected `parameter`, `optional_parameter`, `layer` or `name = \"..\"`",
                            ));
                        }
                    }
                }
            }
            Meta::NameValue(name_value) => {
                return Err(Error::new(
                    name_value.span(),
                    "expected `#[layer]` or `#[layer(..)]`",
                ));
            }
        }
        output.replace((kind, name));
    }
    Ok(output)
}

fn layer_fields(input: &DeriveInput) -> Result<Vec<LayerField>> {
    let fields = match &input.data {
        Data::Struct(data_struct) => &data_struct.fields,
        _ => {
            return Err(Error::new(
                input.ident.span(),
                "Layer can only be derived for structs",
            ));
        }
    };
    let mut output = Vec::new();
    match fields {
        Fields::Named(fields) => {
            for field in fields.named.iter() {
                if let Some((kind, name)) = parse_field_attributes(&field.attrs)? {
                    let ident = field.ident.as_ref().unwrap();
                    let name = name.unwrap_or_else(|| {
                        let name = ident.to_string();
                        name.strip_prefix("r#").map(String::from).unwrap_or(name)
                    });
                    output.push(LayerField {
                        member: quote! { #ident },
                        name,
                        kind,
                    });
                }
            }
        }
        Fields::Unnamed(fields) => {
            for (i, field) in fields.unnamed.iter().enumerate() {
                if let Some((kind, name)) = parse_field_attributes(&field.attrs)? {
                    let index = Index::from(i);
                    output.push(LayerField {
                        member: quote! { #index },
                        name: name.unwrap_or_else(|| i.to_string()),
                        kind,
                    });
                }
            }
        }
        Fields::Unit => (),
    }
    Ok(output)
}

fn derive_layer_impl(input: DeriveInput) -> Result<TokenStream> {
    let krate = if is_layer_crate(&input.attrs) {
        quote! { crate }
    } else {
        quote! { ::cascaded_gaze }
    };
    let fields = layer_fields(&input)?;
    let mut collect_impl = TokenStream::new();
    let mut collect_mut_impl = TokenStream::new();
    let mut named_impl = TokenStream::new();
    let mut named_mut_impl = TokenStream::new();
    let mut set_training_impl = TokenStream::new();
    for LayerField { member, name, kind } in fields.iter() {
        match kind {
            FieldKind::Parameter => {
                collect_impl.extend(quote! {
                    parameters.push(self.#member.clone());
                });
                collect_mut_impl.extend(quote! {
                    parameters.push(&mut self.#member);
                });
                named_impl.extend(quote! {
                    parameters.push((#krate::layer::join_name(prefix, #name), self.#member.clone()));
                });
                named_mut_impl.extend(quote! {
                    parameters.push((#krate::layer::join_name(prefix, #name), &mut self.#member));
                });
                set_training_impl.extend(quote! {
                    self.#member.set_training(training);
                });
            }
            FieldKind::OptionalParameter => {
                collect_impl.extend(quote! {
                    if let Some(parameter) = self.#member.as_ref() {
                        parameters.push(parameter.clone());
                    }
                });
                collect_mut_impl.extend(quote! {
                    if let Some(parameter) = self.#member.as_mut() {
                        parameters.push(parameter);
                    }
                });
                named_impl.extend(quote! {
                    if let Some(parameter) = self.#member.as_ref() {
                        parameters.push((#krate::layer::join_name(prefix, #name), parameter.clone()));
                    }
                });
                named_mut_impl.extend(quote! {
                    if let Some(parameter) = self.#member.as_mut() {
                        parameters.push((#krate::layer::join_name(prefix, #name), parameter));
                    }
                });
                set_training_impl.extend(quote! {
                    if let Some(parameter) = self.#member.as_mut() {
                        parameter.set_training(training);
                    }
                });
            }
            FieldKind::Layer => {
                collect_impl.extend(quote! {
                    #krate::layer::Layer::collect_parameters(&self.#member, parameters);
                });
                collect_mut_impl.extend(quote! {
                    #krate::layer::Layer::collect_parameters_mut(&mut self.#member, parameters);
                });
                named_impl.extend(quote! {
                    #krate::layer::Layer::collect_named_parameters(
                        &self.#member,
                        &#krate::layer::join_name(prefix, #name),
                        parameters,
                    );
                });
                named_mut_impl.extend(quote! {
                    #krate::layer::Layer::collect_named_parameters_mut(
                        &mut self.#member,
                        &#krate::layer::join_name(prefix, #name),
                        parameters,
                    );
                });
                set_training_impl.extend(quote! {
                    #krate::layer::Layer::set_training(&mut self.#member, training)?;
                });
            }
        }
    }
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    Ok(quote! {
        #[automatically_derived]
        impl #impl_generics #krate::layer::Layer for #ident #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn collect_parameters(
                &self,
                parameters: &mut ::std::vec::Vec<#krate::autograd::ParameterD>,
            ) {
                #collect_impl
            }
            #[allow(unused_variables)]
            fn collect_parameters_mut<'layer>(
                &'layer mut self,
                parameters: &mut ::std::vec::Vec<&'layer mut #krate::autograd::ParameterD>,
            ) {
                #collect_mut_impl
            }
            #[allow(unused_variables)]
            fn collect_named_parameters(
                &self,
                prefix: &str,
                parameters: &mut ::std::vec::Vec<(::std::string::String, #krate::autograd::ParameterD)>,
            ) {
                #named_impl
            }
            #[allow(unused_variables)]
            fn collect_named_parameters_mut<'layer>(
                &'layer mut self,
                prefix: &str,
                parameters: &mut ::std::vec::Vec<(
                    ::std::string::String,
                    &'layer mut #krate::autograd::ParameterD,
                )>,
            ) {
                #named_mut_impl
            }
            #[allow(unused_variables)]
            fn set_training(&mut self, training: bool) -> #krate::result::Result<()> {
                #set_training_impl
                Ok(())
            }
        }
    })
}

/// Derives `Layer`.
///
/// See the [crate] docs.
#[proc_macro_derive(Layer, attributes(layer))]
pub fn derive_layer(input: BaseTokenStream) -> BaseTokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match derive_layer_impl(input) {
        Ok(output) => output.into(),
        Err(error) => error.to_compile_error().into(),
    }
}
