//! Silicon model for the scatter-gather DMA IP behind the accelerator's
//! PCIe endpoint.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the IP: register offsets, the config-BAR target layout,
//! the descriptor / result / write-back wire formats and identifier
//! decoding. Every layout here is byte-exact with the hardware; the driver
//! crate builds on it and never hardcodes an offset of its own.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`bar`] | Config BAR target layout (H2C / C2H / IRQ / SGDMA blocks) |
//! | [`regs`] | Per-engine register offsets and bit definitions |
//! | [`desc`] | 32-byte descriptor record and its control word |
//! | [`result`] | Streaming result entry and poll-mode write-back word |
//! | [`ident`] | Engine identifier and alignments register decoding |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bar;
pub mod desc;
pub mod ident;
pub mod regs;
pub mod result;
