//! Service types: provider services, their config negotiators and the
//! matching consumer connection factories.

pub mod engine;
pub mod noop;
pub mod openvpn;
pub mod wireguard;

use serde::{Deserialize, Serialize};

pub use openvpn::VpnConfig;
pub use wireguard::WireguardConfig;

pub const SERVICE_TYPE_NOOP: &str = "noop";
pub const SERVICE_TYPE_OPENVPN: &str = "openvpn";
pub const SERVICE_TYPE_WIREGUARD: &str = "wireguard";

/// Negotiated configuration sent to the consumer.
///
/// Travels over the dialog as JSON bytes and is decoded only by the
/// connection factory of the same service type.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum ServiceConfiguration {
    Noop,
    Openvpn(VpnConfig),
    Wireguard(WireguardConfig),
}

impl ServiceConfiguration {
    pub fn service_type(&self) -> &'static str {
        match self {
            ServiceConfiguration::Noop => SERVICE_TYPE_NOOP,
            ServiceConfiguration::Openvpn(_) => SERVICE_TYPE_OPENVPN,
            ServiceConfiguration::Wireguard(_) => SERVICE_TYPE_WIREGUARD,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
