//! Service proposals advertised by providers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Contact type for proposals reachable over the dialog broker.
pub const CONTACT_TYPE_BROKER: &str = "broker/v1";

/// Coarse provider location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// ISO 3166 country code, empty when unknown
    pub country: String,
}

/// Price charged per billing interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRate {
    pub price_per_interval: u64,
    pub interval_secs: u64,
}

impl PaymentRate {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// How a consumer reaches the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub contact_type: String,
    pub address: String,
}

/// A provider's public offer of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProposal {
    /// Assigned by the provider; unique among its proposals
    pub id: u64,
    pub provider_id: String,
    pub service_type: String,
    pub location: Location,
    pub payment: PaymentRate,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    /// Provider accepts NAT hole punching for sessions on this proposal
    #[serde(default)]
    pub nat_traversal: bool,
    /// Service specific details as opaque JSON
    #[serde(default)]
    pub service_definition: serde_json::Value,
}

impl ServiceProposal {
    pub fn new(provider_id: impl Into<String>, service_type: impl Into<String>) -> Self {
        ServiceProposal {
            id: 0,
            provider_id: provider_id.into(),
            service_type: service_type.into(),
            location: Location::default(),
            payment: PaymentRate {
                price_per_interval: 0,
                interval_secs: 60,
            },
            contacts: Vec::new(),
            nat_traversal: false,
            service_definition: serde_json::Value::Null,
        }
    }

    /// Broker contact address, if the proposal has one.
    pub fn broker_contact(&self) -> Option<&str> {
        self.contacts
            .iter()
            .find(|c| c.contact_type == CONTACT_TYPE_BROKER)
            .map(|c| c.address.as_str())
    }

    /// Replace any existing contact of the same type.
    pub fn set_contact(&mut self, contact: Contact) {
        self.contacts.retain(|c| c.contact_type != contact.contact_type);
        self.contacts.push(contact);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_contact_replaces_same_type() {
        let mut proposal = ServiceProposal::new("0xprovider", "noop");
        proposal.set_contact(Contact {
            contact_type: CONTACT_TYPE_BROKER.into(),
            address: "a".into(),
        });
        proposal.set_contact(Contact {
            contact_type: CONTACT_TYPE_BROKER.into(),
            address: "b".into(),
        });

        assert_eq!(proposal.contacts.len(), 1);
        assert_eq!(proposal.broker_contact(), Some("b"));
    }

    #[test]
    fn proposal_json_defaults() {
        let json = r#"{
            "id": 3,
            "provider_id": "0xp",
            "service_type": "wireguard",
            "location": {"country": "LT"},
            "payment": {"price_per_interval": 10, "interval_secs": 60}
        }"#;
        let proposal: ServiceProposal = serde_json::from_str(json).unwrap();
        assert!(proposal.contacts.is_empty());
        assert!(!proposal.nat_traversal);
        assert_eq!(proposal.payment.interval(), Duration::from_secs(60));
    }
}
