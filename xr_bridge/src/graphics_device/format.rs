/// Pixel formats and their per-API encodings
///
/// Applications name formats with their API's native code (DXGI_FORMAT,
/// VkFormat, GL internal format). The runtime works on [`PixelFormat`] and
/// converts at the boundary.

use crate::graphics_device::GraphicsApi;

/// Swapchain pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum PixelFormat {
    R8G8B8A8_SRGB,
    B8G8R8A8_SRGB,
    R8G8B8A8_UNORM,
    B8G8R8A8_UNORM,
    B8G8R8X8_SRGB,
    B8G8R8X8_UNORM,
    R16G16B16A16_FLOAT,
    D32_FLOAT,
    D32_FLOAT_S8X24_UINT,
    D24_UNORM_S8_UINT,
    D16_UNORM,
}

/// Typeless storage family: images in one family can be viewed with any member format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypelessFamily {
    Rgba8,
    Bgra8,
    Bgrx8,
    Rgba16,
    R32,
    R32G8X24,
    R24G8,
    R16,
}

impl PixelFormat {
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            PixelFormat::D32_FLOAT
                | PixelFormat::D32_FLOAT_S8X24_UINT
                | PixelFormat::D24_UNORM_S8_UINT
                | PixelFormat::D16_UNORM
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(
            self,
            PixelFormat::D32_FLOAT_S8X24_UINT | PixelFormat::D24_UNORM_S8_UINT
        )
    }

    pub fn is_srgb(self) -> bool {
        matches!(
            self,
            PixelFormat::R8G8B8A8_SRGB | PixelFormat::B8G8R8A8_SRGB | PixelFormat::B8G8R8X8_SRGB
        )
    }

    pub fn typeless_family(self) -> TypelessFamily {
        match self {
            PixelFormat::R8G8B8A8_SRGB | PixelFormat::R8G8B8A8_UNORM => TypelessFamily::Rgba8,
            PixelFormat::B8G8R8A8_SRGB | PixelFormat::B8G8R8A8_UNORM => TypelessFamily::Bgra8,
            PixelFormat::B8G8R8X8_SRGB | PixelFormat::B8G8R8X8_UNORM => TypelessFamily::Bgrx8,
            PixelFormat::R16G16B16A16_FLOAT => TypelessFamily::Rgba16,
            PixelFormat::D32_FLOAT => TypelessFamily::R32,
            PixelFormat::D32_FLOAT_S8X24_UINT => TypelessFamily::R32G8X24,
            PixelFormat::D24_UNORM_S8_UINT => TypelessFamily::R24G8,
            PixelFormat::D16_UNORM => TypelessFamily::R16,
        }
    }

    /// Format handed to the compositor
    ///
    /// The compositor has no 32-bit depth + stencil format: the stencil plane is
    /// dropped and the depth plane is resolved into a D32 image.
    pub fn submission_format(self) -> PixelFormat {
        match self {
            PixelFormat::D32_FLOAT_S8X24_UINT => PixelFormat::D32_FLOAT,
            other => other,
        }
    }

    /// Native code of this format in `api`, if the API can express it
    pub fn to_api(self, api: GraphicsApi) -> Option<i64> {
        match api {
            GraphicsApi::D3D11 | GraphicsApi::D3D12 => Some(dxgi_code(self)),
            GraphicsApi::Vulkan => vk_code(self),
            GraphicsApi::OpenGL => gl_code(self),
        }
    }

    /// Parse an application-provided native code
    pub fn from_api(api: GraphicsApi, code: i64) -> Option<PixelFormat> {
        ALL_FORMATS
            .iter()
            .copied()
            .find(|f| f.to_api(api) == Some(code))
    }
}

const ALL_FORMATS: [PixelFormat; 11] = [
    PixelFormat::R8G8B8A8_SRGB,
    PixelFormat::B8G8R8A8_SRGB,
    PixelFormat::R8G8B8A8_UNORM,
    PixelFormat::B8G8R8A8_UNORM,
    PixelFormat::B8G8R8X8_SRGB,
    PixelFormat::B8G8R8X8_UNORM,
    PixelFormat::R16G16B16A16_FLOAT,
    PixelFormat::D32_FLOAT,
    PixelFormat::D32_FLOAT_S8X24_UINT,
    PixelFormat::D24_UNORM_S8_UINT,
    PixelFormat::D16_UNORM,
];

fn dxgi_code(format: PixelFormat) -> i64 {
    match format {
        PixelFormat::R8G8B8A8_SRGB => 29,
        PixelFormat::B8G8R8A8_SRGB => 91,
        PixelFormat::R8G8B8A8_UNORM => 28,
        PixelFormat::B8G8R8A8_UNORM => 87,
        PixelFormat::B8G8R8X8_SRGB => 93,
        PixelFormat::B8G8R8X8_UNORM => 88,
        PixelFormat::R16G16B16A16_FLOAT => 10,
        PixelFormat::D32_FLOAT => 40,
        PixelFormat::D32_FLOAT_S8X24_UINT => 20,
        PixelFormat::D24_UNORM_S8_UINT => 45,
        PixelFormat::D16_UNORM => 55,
    }
}

fn vk_code(format: PixelFormat) -> Option<i64> {
    match format {
        PixelFormat::R8G8B8A8_SRGB => Some(43),
        PixelFormat::B8G8R8A8_SRGB => Some(50),
        PixelFormat::R8G8B8A8_UNORM => Some(37),
        PixelFormat::B8G8R8A8_UNORM => Some(44),
        PixelFormat::R16G16B16A16_FLOAT => Some(97),
        PixelFormat::D32_FLOAT => Some(126),
        PixelFormat::D32_FLOAT_S8X24_UINT => Some(130),
        PixelFormat::D24_UNORM_S8_UINT => Some(129),
        PixelFormat::D16_UNORM => Some(124),
        PixelFormat::B8G8R8X8_SRGB | PixelFormat::B8G8R8X8_UNORM => None,
    }
}

fn gl_code(format: PixelFormat) -> Option<i64> {
    match format {
        PixelFormat::R16G16B16A16_FLOAT => Some(0x881A),
        PixelFormat::R8G8B8A8_SRGB => Some(0x8C43),
        PixelFormat::R8G8B8A8_UNORM => Some(0x8058),
        PixelFormat::D32_FLOAT => Some(0x8CAC),
        PixelFormat::D32_FLOAT_S8X24_UINT => Some(0x8CAD),
        PixelFormat::D24_UNORM_S8_UINT => Some(0x88F0),
        PixelFormat::D16_UNORM => Some(0x81A5),
        _ => None,
    }
}

// ===== ENUMERATION =====

const DXGI_PREFERENCE: [PixelFormat; 11] = [
    PixelFormat::R8G8B8A8_SRGB,
    PixelFormat::B8G8R8A8_SRGB,
    PixelFormat::R8G8B8A8_UNORM,
    PixelFormat::B8G8R8A8_UNORM,
    PixelFormat::B8G8R8X8_SRGB,
    PixelFormat::B8G8R8X8_UNORM,
    PixelFormat::R16G16B16A16_FLOAT,
    PixelFormat::D32_FLOAT,
    PixelFormat::D32_FLOAT_S8X24_UINT,
    PixelFormat::D24_UNORM_S8_UINT,
    PixelFormat::D16_UNORM,
];

const VK_PREFERENCE: [PixelFormat; 9] = [
    PixelFormat::R8G8B8A8_SRGB,
    PixelFormat::B8G8R8A8_SRGB,
    PixelFormat::R8G8B8A8_UNORM,
    PixelFormat::B8G8R8A8_UNORM,
    PixelFormat::R16G16B16A16_FLOAT,
    PixelFormat::D32_FLOAT,
    PixelFormat::D32_FLOAT_S8X24_UINT,
    PixelFormat::D24_UNORM_S8_UINT,
    PixelFormat::D16_UNORM,
];

const GL_PREFERENCE: [PixelFormat; 7] = [
    PixelFormat::R16G16B16A16_FLOAT,
    PixelFormat::R8G8B8A8_SRGB,
    PixelFormat::R8G8B8A8_UNORM,
    PixelFormat::D32_FLOAT,
    PixelFormat::D32_FLOAT_S8X24_UINT,
    PixelFormat::D24_UNORM_S8_UINT,
    PixelFormat::D16_UNORM,
];

/// Formats a binding may create swapchains with, most preferred first
///
/// Stencil formats are omitted when the negotiated handle-sharing mode cannot
/// carry a stencil plane across devices.
pub fn supported_formats(api: GraphicsApi, stencil_shareable: bool) -> Vec<PixelFormat> {
    let preference: &[PixelFormat] = match api {
        GraphicsApi::D3D11 | GraphicsApi::D3D12 => &DXGI_PREFERENCE,
        GraphicsApi::Vulkan => &VK_PREFERENCE,
        GraphicsApi::OpenGL => &GL_PREFERENCE,
    };
    preference
        .iter()
        .copied()
        .filter(|f| stencil_shareable || !f.has_stencil())
        .collect()
}

/// Same as [`supported_formats`], as native codes
pub fn supported_format_codes(api: GraphicsApi, stencil_shareable: bool) -> Vec<i64> {
    supported_formats(api, stencil_shareable)
        .into_iter()
        .filter_map(|f| f.to_api(api))
        .collect()
}

#[cfg(test)]
#[path = "format_tests.rs"]
mod tests;
