//! Debug flags and command stream disassembly.
//!
//! Disassembly walks a validated stream and prints one line per record with
//! the method name resolved through the bound engine classes. Everything
//! here is gated on [`DebugFlags`] parsed from the `NVSUB_DEBUG` environment
//! variable and stays off the hot path.

use std::io::{self, Write};

use bitflags::bitflags;

use crate::bo::DeviceInfo;
use crate::cl::{cl90b5, cl9097, cla0c0};
use crate::push::{HdrForm, PushStream, SUBC_2D, SUBC_3D, SUBC_COMPUTE, SUBC_COPY, SUBC_M2MF};

bitflags! {
    /// Debug behavior toggles, parsed once from `NVSUB_DEBUG`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugFlags: u32 {
        /// Disassemble every stream as it is submitted.
        const PUSH_DUMP = 1 << 0;
        /// Disassemble a stream when its submission fails.
        const PUSH_SYNC = 1 << 1;
    }
}

impl DebugFlags {
    /// Parse the comma-separated `NVSUB_DEBUG` token list. Unknown tokens
    /// are warned about and ignored.
    pub fn from_env() -> Self {
        match std::env::var("NVSUB_DEBUG") {
            Ok(value) => Self::parse(&value),
            Err(_) => Self::empty(),
        }
    }

    fn parse(value: &str) -> Self {
        let mut flags = Self::empty();
        for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "push_dump" => flags |= Self::PUSH_DUMP,
                "push_sync" => flags |= Self::PUSH_SYNC,
                other => log::warn!("unknown NVSUB_DEBUG token \"{other}\""),
            }
        }
        flags
    }
}

fn subc_class(info: &DeviceInfo, subc: u8) -> Option<u16> {
    match subc {
        SUBC_3D | SUBC_2D => Some(info.cls_eng3d),
        SUBC_COMPUTE => Some(info.cls_compute),
        SUBC_M2MF | SUBC_COPY => Some(info.cls_copy),
        _ => None,
    }
}

/// Resolve a method offset to its name for the engine bound to `subc`.
///
/// The table covers the methods this crate emits itself; offsets are stable
/// across the hardware generations each class family spans.
pub fn method_name(info: &DeviceInfo, subc: u8, mthd: u16) -> Option<&'static str> {
    subc_class(info, subc)?;
    match (subc, mthd) {
        (SUBC_3D, cl9097::SET_TEX_SAMPLER_POOL_A) => Some("SET_TEX_SAMPLER_POOL_A"),
        (SUBC_3D, cl9097::SET_TEX_SAMPLER_POOL_B) => Some("SET_TEX_SAMPLER_POOL_B"),
        (SUBC_3D, cl9097::SET_TEX_SAMPLER_POOL_C) => Some("SET_TEX_SAMPLER_POOL_C"),
        (SUBC_3D, cl9097::SET_TEX_HEADER_POOL_A) => Some("SET_TEX_HEADER_POOL_A"),
        (SUBC_3D, cl9097::SET_TEX_HEADER_POOL_B) => Some("SET_TEX_HEADER_POOL_B"),
        (SUBC_3D, cl9097::SET_TEX_HEADER_POOL_C) => Some("SET_TEX_HEADER_POOL_C"),
        (SUBC_3D, cl9097::INVALIDATE_SAMPLER_CACHE_NO_WFI) => {
            Some("INVALIDATE_SAMPLER_CACHE_NO_WFI")
        }
        (SUBC_3D, cl9097::INVALIDATE_TEXTURE_HEADER_CACHE_NO_WFI) => {
            Some("INVALIDATE_TEXTURE_HEADER_CACHE_NO_WFI")
        }
        (SUBC_COMPUTE, cla0c0::SET_TEX_SAMPLER_POOL_A) => Some("SET_TEX_SAMPLER_POOL_A"),
        (SUBC_COMPUTE, cla0c0::SET_TEX_SAMPLER_POOL_B) => Some("SET_TEX_SAMPLER_POOL_B"),
        (SUBC_COMPUTE, cla0c0::SET_TEX_SAMPLER_POOL_C) => Some("SET_TEX_SAMPLER_POOL_C"),
        (SUBC_COMPUTE, cla0c0::SET_TEX_HEADER_POOL_A) => Some("SET_TEX_HEADER_POOL_A"),
        (SUBC_COMPUTE, cla0c0::SET_TEX_HEADER_POOL_B) => Some("SET_TEX_HEADER_POOL_B"),
        (SUBC_COMPUTE, cla0c0::SET_TEX_HEADER_POOL_C) => Some("SET_TEX_HEADER_POOL_C"),
        (SUBC_COMPUTE, cla0c0::INVALIDATE_SAMPLER_CACHE) => Some("INVALIDATE_SAMPLER_CACHE"),
        (SUBC_COMPUTE, cla0c0::INVALIDATE_TEXTURE_HEADER_CACHE) => {
            Some("INVALIDATE_TEXTURE_HEADER_CACHE")
        }
        (SUBC_COPY, cl90b5::NOP) => Some("NOP"),
        _ => None,
    }
}

fn form_name(form: HdrForm) -> &'static str {
    match form {
        HdrForm::ZeroInc => "0inc",
        HdrForm::NInc => "ninc",
        HdrForm::Immediate => "immd",
        HdrForm::OneInc => "1inc",
    }
}

/// Print a human-readable disassembly of `push` to `out`.
pub fn dump_push(
    out: &mut dyn Write,
    push: &PushStream,
    info: &DeviceInfo,
) -> io::Result<()> {
    for record in push.records() {
        let hdr = record.header;
        let name = match method_name(info, hdr.subc, hdr.mthd) {
            Some(name) => name.to_string(),
            None => format!("{:#06x}", hdr.mthd),
        };

        if hdr.form == HdrForm::Immediate {
            writeln!(out, "{} subc {} {} <- {:#x}", form_name(hdr.form), hdr.subc, name, hdr.value)?;
        } else {
            writeln!(out, "{} subc {} {} ({} dw)", form_name(hdr.form), hdr.subc, name, hdr.value)?;
            for (i, word) in record.payload.iter().enumerate() {
                writeln!(out, "    +{i:<3} {word:#010x}")?;
            }
        }
    }
    Ok(())
}
