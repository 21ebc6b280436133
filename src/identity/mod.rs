use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::channels::ChannelType;
use crate::shared::models::Customer;
use crate::store::{EngineStore, InsertOutcome, StoreError};

/// Typed channel identifier. The (kind, value) pair is globally unique in
/// the store; this enum is the only place channel identifiers are classified.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Email,
    Phone,
    WhatsAppId,
}

impl std::fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Phone => write!(f, "phone"),
            Self::WhatsAppId => write!(f, "whatsapp_id"),
        }
    }
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::WhatsAppId => "whatsapp_id",
        }
    }
}

pub fn kind_for_channel(channel: ChannelType) -> IdentifierKind {
    match channel {
        ChannelType::Email => IdentifierKind::Email,
        ChannelType::WhatsApp => IdentifierKind::WhatsAppId,
        // Web chat asks for an email address up front.
        ChannelType::Web => IdentifierKind::Email,
    }
}

/// Extra identifying signals carried in event metadata, e.g. an email
/// surfaced by a WhatsApp business profile.
pub fn secondary_identifiers(
    metadata: &HashMap<String, serde_json::Value>,
) -> Vec<(IdentifierKind, String)> {
    let mut found = Vec::new();
    for key in ["email", "profile_email", "contact_email"] {
        if let Some(value) = metadata.get(key).and_then(|v| v.as_str()) {
            if value.contains('@') {
                found.push((IdentifierKind::Email, value.to_lowercase()));
            }
        }
    }
    for key in ["phone", "profile_phone", "contact_phone"] {
        if let Some(value) = metadata.get(key).and_then(|v| v.as_str()) {
            if !value.is_empty() {
                found.push((IdentifierKind::Phone, value.to_string()));
            }
        }
    }
    found
}

#[derive(Debug)]
pub enum IdentityError {
    Store(StoreError),
    /// A customer row disappeared between lookups; permanent for this event.
    Unresolvable(String),
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "Identity store failure: {e}"),
            Self::Unresolvable(msg) => write!(f, "Unresolvable identity: {msg}"),
        }
    }
}

impl std::error::Error for IdentityError {}

impl From<StoreError> for IdentityError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Maps channel-specific identifiers to canonical customers, creating one
/// when nothing matches and merging when a later message reveals that two
/// customers are the same person.
pub struct IdentityResolver {
    store: Arc<dyn EngineStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    /// Resolves to the canonical customer ID for this event's identifier,
    /// consulting secondary signals in the metadata for cross-channel
    /// matches.
    pub async fn resolve(
        &self,
        channel: ChannelType,
        identifier_value: &str,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<Uuid, IdentityError> {
        let kind = kind_for_channel(channel);
        let value = normalize(kind, identifier_value);
        let secondary = secondary_identifiers(metadata);

        if let Some(row) = self.store.find_identifier(kind.as_str(), &value).await? {
            let mut canonical = self.follow(row.customer_id).await?;
            // A known identifier can still reveal a merge: a secondary
            // signal may point at a different live customer.
            for (other_kind, other_value) in &secondary {
                if let Some(other) = self
                    .store
                    .find_identifier(other_kind.as_str(), other_value)
                    .await?
                {
                    let other_canonical = self.follow(other.customer_id).await?;
                    if other_canonical.id != canonical.id {
                        canonical = self.merge(canonical, other_canonical).await?;
                    }
                }
            }
            return Ok(canonical.id);
        }

        // Unknown identifier: try to attach it to a customer matched by a
        // secondary signal (the cross-channel path).
        for (other_kind, other_value) in &secondary {
            let matched = match self
                .store
                .find_identifier(other_kind.as_str(), other_value)
                .await?
            {
                Some(row) => Some(self.follow(row.customer_id).await?),
                None if *other_kind == IdentifierKind::Email => {
                    self.store.find_customer_by_email(other_value).await?
                }
                None => None,
            };
            if let Some(customer) = matched {
                info!(
                    "Attaching {kind} identifier to customer {} via {other_kind} match",
                    customer.id
                );
                return self.attach(customer.id, kind, &value).await;
            }
        }

        self.create_with_identifier(kind, &value, &secondary, metadata)
            .await
    }

    /// Follows a merge redirect. Merges always repoint to the canonical
    /// root, so one hop suffices.
    async fn follow(&self, customer_id: Uuid) -> Result<Customer, IdentityError> {
        let customer = self
            .store
            .get_customer(customer_id)
            .await?
            .ok_or_else(|| IdentityError::Unresolvable(format!("customer {customer_id}")))?;
        match customer.merged_into {
            Some(target) => self
                .store
                .get_customer(target)
                .await?
                .ok_or_else(|| IdentityError::Unresolvable(format!("merge target {target}"))),
            None => Ok(customer),
        }
    }

    async fn attach(
        &self,
        customer_id: Uuid,
        kind: IdentifierKind,
        value: &str,
    ) -> Result<Uuid, IdentityError> {
        match self
            .store
            .insert_identifier(customer_id, kind.as_str(), value)
            .await?
        {
            InsertOutcome::Inserted => Ok(customer_id),
            InsertOutcome::Conflict => {
                // Lost a race: somebody bound (kind, value) first. Re-read
                // and go with the winner.
                let row = self
                    .store
                    .find_identifier(kind.as_str(), value)
                    .await?
                    .ok_or_else(|| {
                        IdentityError::Unresolvable(format!("{kind}:{value} vanished"))
                    })?;
                Ok(self.follow(row.customer_id).await?.id)
            }
        }
    }

    async fn create_with_identifier(
        &self,
        kind: IdentifierKind,
        value: &str,
        secondary: &[(IdentifierKind, String)],
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<Uuid, IdentityError> {
        let display_name = metadata
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let primary_email = if kind == IdentifierKind::Email {
            Some(value.to_string())
        } else {
            secondary
                .iter()
                .find(|(k, _)| *k == IdentifierKind::Email)
                .map(|(_, v)| v.clone())
        };

        let customer = Customer::new(display_name, primary_email.clone());
        let customer_id = customer.id;
        match self.store.create_customer(customer).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                // One live customer per primary email: attach to the holder.
                if let Some(email) = &primary_email {
                    if let Some(existing) = self.store.find_customer_by_email(email).await? {
                        return self.attach(existing.id, kind, value).await;
                    }
                }
                return Err(IdentityError::Unresolvable(format!(
                    "customer create conflict for {kind}:{value}"
                )));
            }
            Err(e) => return Err(e.into()),
        }

        let resolved = self.attach(customer_id, kind, value).await?;
        if resolved != customer_id {
            // Concurrent delivery created the customer first. Our fresh row
            // carries no history; fold it into the winner as a redirect.
            warn!("Lost identifier race for {kind}:{value}, merging fresh customer");
            self.store.merge_customers(resolved, customer_id).await?;
            return Ok(resolved);
        }

        for (other_kind, other_value) in secondary {
            if *other_kind == kind && other_value == value {
                continue;
            }
            if self
                .store
                .insert_identifier(customer_id, other_kind.as_str(), other_value)
                .await?
                == InsertOutcome::Conflict
            {
                warn!("Secondary identifier {other_kind}:{other_value} already bound elsewhere");
            }
        }
        Ok(customer_id)
    }

    /// Merge tie-break: the customer with the earlier first contact stays
    /// canonical; the other becomes a redirect.
    async fn merge(&self, a: Customer, b: Customer) -> Result<Customer, IdentityError> {
        let (canonical, absorbed) = if a.first_contact <= b.first_contact {
            (a, b)
        } else {
            (b, a)
        };
        info!(
            "Merging customer {} into {} (earlier first contact wins)",
            absorbed.id, canonical.id
        );
        self.store
            .merge_customers(canonical.id, absorbed.id)
            .await?;
        self.store
            .get_customer(canonical.id)
            .await?
            .ok_or_else(|| IdentityError::Unresolvable(format!("customer {}", canonical.id)))
    }
}

fn normalize(kind: IdentifierKind, value: &str) -> String {
    match kind {
        IdentifierKind::Email => value.trim().to_lowercase(),
        IdentifierKind::Phone | IdentifierKind::WhatsAppId => value.trim().to_string(),
    }
}
