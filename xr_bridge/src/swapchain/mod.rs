/// Swapchain module - image rings, registry, provisioning and slice resolution

pub mod swapchain;
pub mod registry;
pub mod provisioner;
pub mod slice_resolver;

pub use swapchain::*;
pub use registry::{validate_desc, SwapchainHandle, SwapchainRegistry};
pub use provisioner::{ImportKey, Provisioned, ResourceProvisioner, SLOW_PATH_RING_LENGTH};
pub use slice_resolver::{PreparedSlice, ResolveOutcome, Slice, SliceResolver};
