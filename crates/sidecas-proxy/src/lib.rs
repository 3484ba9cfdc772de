//! sidecas: a local cache proxy for remote content-addressable storage
//!
//! The proxy fronts an authoritative remote CAS for a fleet of build
//! executors: reads are served from a local blob store when possible,
//! misses stream through to the remote and are written back, and two
//! background pipelines batch access-time updates and cache-hit
//! accounting to the remote per tenant.

pub mod atime;
pub mod bytestream_proxy;
pub mod cas_proxy;
pub mod channel;
pub mod config;
pub mod convert;
pub mod hit_tracker;
pub mod lifecycle;
pub mod remote;
pub mod tree_cache;

/// Generated protobuf types
pub mod proto {
    /// Bazel Remote Execution API v2 types
    pub mod build {
        pub mod bazel {
            pub mod remote {
                pub mod execution {
                    pub mod v2 {
                        tonic::include_proto!("build.bazel.remote.execution.v2");
                    }
                }
            }
        }
    }

    /// Google API types
    pub mod google {
        pub mod bytestream {
            tonic::include_proto!("google.bytestream");
        }
        pub mod rpc {
            tonic::include_proto!("google.rpc");
        }
    }

    /// sidecas' own telemetry surface
    pub mod sidecas {
        pub mod resource {
            pub mod v1 {
                tonic::include_proto!("sidecas.resource.v1");
            }
        }
        pub mod atime {
            pub mod v1 {
                tonic::include_proto!("sidecas.atime.v1");
            }
        }
        pub mod hit_tracker {
            pub mod v1 {
                tonic::include_proto!("sidecas.hit_tracker.v1");
            }
        }
    }
}

// Type aliases for convenience
pub use proto::build::bazel::remote::execution::v2 as reapi;
pub use proto::google::bytestream as bspb;
pub use proto::sidecas::atime::v1 as atimepb;
pub use proto::sidecas::hit_tracker::v1 as hitpb;
pub use proto::sidecas::resource::v1 as rspb;

pub use atime::AtimeUpdater;
pub use bytestream_proxy::ByteStreamProxy;
pub use cas_proxy::CasProxy;
pub use config::ProxyConfig;
pub use hit_tracker::{HitTracker, HitTrackerFactory, TransferTimer};
pub use lifecycle::CacheProxy;
pub use tree_cache::TreeCache;
