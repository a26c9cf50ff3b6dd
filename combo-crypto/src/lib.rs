//! Accu-Chek Combo wire cryptography.
//!
//! A minimal toolbox: a fixed 128-bit block cipher, the 8-byte packet MAC
//! derived from it, a 13-byte replay nonce, CRC-16 for the pairing
//! sub-protocol, and the PIN-derived weak key used before real cipher keys
//! are established.

#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(unused_crate_dependencies)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_qualifications)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub use crate::{cipher::*, crc16::*, mac::*, nonce::*, pin::*};

mod cipher;
mod crc16;
mod mac;
mod nonce;
mod pin;
