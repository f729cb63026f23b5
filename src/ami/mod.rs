//! Client for the switch's manager interface (AMI): a line oriented TCP
//! protocol carrying request/response actions and unsolicited events.

pub mod action;
pub mod calls;
pub mod client;
pub mod codec;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod extension;
pub mod sipconfig;
#[cfg(test)]
mod tests;

pub use action::AmiAction;
pub use calls::{Call, CallDirection, CallOutcome, CallStatus};
pub use client::{
    ActionReply, AmiClient, AmiClientBuilder, ClientStatus, ConnectionState, OriginateOptions,
};
pub use error::{AmiError, AmiResult};
pub use extension::{ExtensionState, ExtensionStatus};
pub use sipconfig::SipClientConfig;
