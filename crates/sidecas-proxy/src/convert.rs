//! Conversions between core domain types and generated proto types

use crate::{reapi, rspb};
use prost::Message;
use sidecas_core::{
    CacheType, Compressor, Digest, DigestFunction, ProxyError, RequestContext, ResourceName, Result,
};
use tonic::metadata::MetadataMap;

/// Binary metadata key Bazel clients use to attach request metadata
pub const REQUEST_METADATA_KEY: &str = "build.bazel.remote.execution.v2.requestmetadata-bin";

/// Convert a core Digest to the proto Digest
pub fn digest_to_proto(digest: &Digest) -> reapi::Digest {
    reapi::Digest {
        hash: digest.hash.clone(),
        size_bytes: digest.size_bytes,
    }
}

/// Convert a proto Digest to a core Digest, validating the hash
pub fn proto_to_digest(proto: &reapi::Digest, function: DigestFunction) -> Result<Digest> {
    Digest::new(&proto.hash, proto.size_bytes, function)
}

pub fn digest_function_to_proto(function: DigestFunction) -> i32 {
    match function {
        DigestFunction::Sha256 => reapi::digest_function::Value::Sha256 as i32,
        DigestFunction::Blake3 => reapi::digest_function::Value::Blake3 as i32,
    }
}

/// Map a proto digest-function value to a core function
///
/// UNKNOWN means SHA256 for compatibility with clients predating the
/// field.
pub fn digest_function_from_proto(value: i32) -> Result<DigestFunction> {
    match reapi::digest_function::Value::try_from(value) {
        Ok(reapi::digest_function::Value::Unknown | reapi::digest_function::Value::Sha256) => {
            Ok(DigestFunction::Sha256)
        }
        Ok(reapi::digest_function::Value::Blake3) => Ok(DigestFunction::Blake3),
        _ => Err(ProxyError::invalid_argument(format!(
            "unsupported digest function: {value}"
        ))),
    }
}

pub fn compressor_to_proto(compressor: Compressor) -> i32 {
    match compressor {
        Compressor::Identity => reapi::compressor::Value::Identity as i32,
        Compressor::Zstd => reapi::compressor::Value::Zstd as i32,
    }
}

pub fn compressor_from_proto(value: i32) -> Result<Compressor> {
    match reapi::compressor::Value::try_from(value) {
        Ok(reapi::compressor::Value::Identity) => Ok(Compressor::Identity),
        Ok(reapi::compressor::Value::Zstd) => Ok(Compressor::Zstd),
        _ => Err(ProxyError::invalid_argument(format!(
            "unsupported compressor: {value}"
        ))),
    }
}

fn cache_type_to_proto(cache_type: CacheType) -> i32 {
    match cache_type {
        CacheType::Cas => rspb::CacheType::Cas as i32,
        CacheType::ActionCache => rspb::CacheType::Ac as i32,
    }
}

/// Convert a core ResourceName to the telemetry proto form
pub fn resource_to_proto(resource: &ResourceName) -> rspb::ResourceName {
    rspb::ResourceName {
        digest: Some(digest_to_proto(resource.digest())),
        instance_name: resource.instance_name().to_string(),
        cache_type: cache_type_to_proto(resource.cache_type()),
        compressor: compressor_to_proto(resource.compressor()),
        digest_function: digest_function_to_proto(resource.digest_function()),
    }
}

/// Decode the request metadata Bazel clients attach as binary metadata
pub fn request_metadata_from_metadata(metadata: &MetadataMap) -> Option<reapi::RequestMetadata> {
    let value = metadata.get_bin(REQUEST_METADATA_KEY)?;
    let bytes = value.to_bytes().ok()?;
    reapi::RequestMetadata::decode(bytes.as_ref()).ok()
}

/// Extract the request context and optional Bazel request metadata from
/// an inbound request's metadata
pub fn context_from_request<T>(request: &tonic::Request<T>) -> (RequestContext, Option<reapi::RequestMetadata>) {
    let metadata = request.metadata();
    (
        RequestContext::from_metadata(metadata),
        request_metadata_from_metadata(metadata),
    )
}

/// Per-entry OK status for batch responses
pub fn status_ok() -> crate::proto::google::rpc::Status {
    crate::proto::google::rpc::Status {
        code: tonic::Code::Ok as i32,
        message: String::new(),
        details: vec![],
    }
}

/// Per-entry status from an error, preserving remote codes
pub fn status_from_error(err: &ProxyError) -> crate::proto::google::rpc::Status {
    crate::proto::google::rpc::Status {
        code: err.code() as i32,
        message: err.to_string(),
        details: vec![],
    }
}
