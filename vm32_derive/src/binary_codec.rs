//! Derive macro for wire serialization of program-image records.
//!
//! Generates `Encode` and `Decode` implementations that write fields in
//! declaration order using the `vm32::types::encoding` primitives: fixed-width
//! little-endian integers, u16-length-prefixed strings, u32-count-prefixed
//! vectors. This matches the image header and symbol-table wire format, which
//! is all the derive is used for; enums and unions are rejected.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let expanded = match &input.data {
        Data::Struct(data_struct) => match &data_struct.fields {
            Fields::Named(fields) => named_struct_impl(name, fields),
            Fields::Unnamed(fields) => tuple_struct_impl(name, fields),
            Fields::Unit => syn::Error::new_spanned(
                &input,
                "BinaryCodec derive does not support unit structs",
            )
            .to_compile_error(),
        },
        _ => syn::Error::new_spanned(
            &input,
            "BinaryCodec derive supports structs only; implement Encode/Decode by hand for enums",
        )
        .to_compile_error(),
    };

    TokenStream::from(expanded)
}

/// `Encode`/`Decode` for named-field structs: each field in declaration order.
fn named_struct_impl(name: &syn::Ident, fields: &syn::FieldsNamed) -> proc_macro2::TokenStream {
    let field_names: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();

    let encode_fields = field_names.iter().map(|field| {
        quote! {
            crate::types::encoding::Encode::encode(&self.#field, out);
        }
    });

    let decode_fields = field_names.iter().map(|field| {
        quote! {
            #field: crate::types::encoding::Decode::decode(input)?,
        }
    });

    quote! {
        impl crate::types::encoding::Encode for #name {
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                #(#encode_fields)*
            }
        }

        impl crate::types::encoding::Decode for #name {
            fn decode(
                input: &mut &[u8],
            ) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                Ok(Self {
                    #(#decode_fields)*
                })
            }
        }
    }
}

/// `Encode`/`Decode` for tuple structs, used by newtype wire wrappers.
fn tuple_struct_impl(name: &syn::Ident, fields: &syn::FieldsUnnamed) -> proc_macro2::TokenStream {
    let indices: Vec<_> = (0..fields.unnamed.len()).map(syn::Index::from).collect();

    let encode_fields = indices.iter().map(|idx| {
        quote! {
            crate::types::encoding::Encode::encode(&self.#idx, out);
        }
    });

    let decode_fields = indices.iter().map(|_| {
        quote! {
            crate::types::encoding::Decode::decode(input)?,
        }
    });

    quote! {
        impl crate::types::encoding::Encode for #name {
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                #(#encode_fields)*
            }
        }

        impl crate::types::encoding::Decode for #name {
            fn decode(
                input: &mut &[u8],
            ) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                Ok(Self(
                    #(#decode_fields)*
                ))
            }
        }
    }
}
