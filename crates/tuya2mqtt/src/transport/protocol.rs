//! Messages exchanged with the transport helper.
//!
//! Newline-delimited JSON over the helper's stdin/stdout. Every request gets
//! exactly one response.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::entity::WriteValue;
use crate::status::Address;
use crate::status::StatusValue;

/// Messages sent to the helper
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request<'a> {
    /// Open the device session
    Connect {
        id: &'a str,
        address: &'a str,
        key: &'a str,
        version: &'a str,
        timeout_secs: u64,
        debug: bool,
    },

    /// Read every data point
    Status,

    /// Write one data point
    Set { address: Address, value: WriteValue },

    /// Close the session; the helper exits after answering
    Close,
}

/// Messages received from the helper
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Session established
    Ready,

    Status {
        dps: BTreeMap<String, StatusValue>,
    },

    Ok,

    Error {
        message: String,
    },
}
