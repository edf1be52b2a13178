//! Method offsets for the engine classes this crate programs itself.
//!
//! Full class headers run to thousands of methods; only the handful the
//! submission core emits (descriptor pool pointers, cache invalidates, the
//! copy-engine NOP) live here. Everything else is emitted by the state
//! packing layers above us and shows up in disassembly as a raw offset.

/// Fermi+ 3D class (`NV9097` and successors keep these offsets).
pub mod cl9097 {
    pub const SET_TEX_SAMPLER_POOL_A: u16 = 0x155c;
    pub const SET_TEX_SAMPLER_POOL_B: u16 = 0x1560;
    pub const SET_TEX_SAMPLER_POOL_C: u16 = 0x1564;
    pub const SET_TEX_HEADER_POOL_A: u16 = 0x1574;
    pub const SET_TEX_HEADER_POOL_B: u16 = 0x1578;
    pub const SET_TEX_HEADER_POOL_C: u16 = 0x157c;
    pub const INVALIDATE_SAMPLER_CACHE_NO_WFI: u16 = 0x1330;
    pub const INVALIDATE_TEXTURE_HEADER_CACHE_NO_WFI: u16 = 0x1334;
}

/// Kepler+ compute class (`NVA0C0` and successors keep these offsets).
pub mod cla0c0 {
    pub const SET_TEX_SAMPLER_POOL_A: u16 = 0x0d28;
    pub const SET_TEX_SAMPLER_POOL_B: u16 = 0x0d2c;
    pub const SET_TEX_SAMPLER_POOL_C: u16 = 0x0d30;
    pub const SET_TEX_HEADER_POOL_A: u16 = 0x0d10;
    pub const SET_TEX_HEADER_POOL_B: u16 = 0x0d14;
    pub const SET_TEX_HEADER_POOL_C: u16 = 0x0d18;
    pub const INVALIDATE_SAMPLER_CACHE: u16 = 0x1330;
    pub const INVALIDATE_TEXTURE_HEADER_CACHE: u16 = 0x1334;
}

/// Fermi+ copy class (`NV90B5` and successors keep these offsets).
pub mod cl90b5 {
    pub const NOP: u16 = 0x0100;
}
