//! Testing utilities for the log
//!
//! - **MemoryDriver**: an in-memory dataset that plays both base driver and
//!   catalog, records every call it receives and can be told to fail writes
//!   to chosen variables
//! - **ints / to_ints**: native-endian `i32` payload helpers
//!
//! # Example
//!
//! ```ignore
//! use stagelog_durability::testing::{ints, MemoryDriver};
//!
//! let mut driver = MemoryDriver::new("/data/out.nc");
//! let x = driver.define_dimension("x", Some(10))?;
//! let v = driver.define_variable("v", ElementType::Int, &[x])?;
//! ```

mod memory_driver;

pub use memory_driver::{DriverCall, MemoryDriver, RecordedWrite, INJECTED_FAILURE};

use byteorder::{ByteOrder, NativeEndian};

/// Encode `values` as a native-endian payload.
pub fn ints(values: &[i32]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len() * 4];
    NativeEndian::write_i32_into(values, &mut bytes);
    bytes
}

/// Decode a native-endian `i32` payload.
pub fn to_ints(bytes: &[u8]) -> Vec<i32> {
    let mut values = vec![0i32; bytes.len() / 4];
    NativeEndian::read_i32_into(&bytes[..values.len() * 4], &mut values);
    values
}
