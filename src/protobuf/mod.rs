//! Generated protobuf modules
//!
//! build.rs compiles the Meshtastic message subset under `protos/meshtastic`; prost emits
//! one file per package (`meshtastic.rs`).

pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types.
    //! Wrapped in a submodule with broad allow() attributes so unused generated API
    //! does not drown the build in warnings.
    #[allow(dead_code, unused_imports, unused_variables, unused_mut, unused_macros)]
    #[allow(clippy::all)]
    #[allow(rustdoc::invalid_html_tags)]
    mod inner {
        include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
    }
    pub use inner::*;
}
