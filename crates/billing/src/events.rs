//! Sandbox billing event model
//!
//! The closed set of event kinds accepted by the webhook ingress, as a
//! tagged union over `{"type": ..., "data": ...}`. Deserialization here is
//! the sole normalization boundary: nothing downstream ever sees a
//! malformed event. New kinds are added as new variants plus a handler arm
//! in the effect engine, never by string branching beyond the tag.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription plan tiers. Unknown plan strings fail deserialization and
/// are rejected at the ingress as validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Starter,
    Standard,
    Premium,
}

/// Modules every tenant keeps regardless of subscription state
pub const CORE_MODULES: &[&str] = &["pos"];

/// Every module any plan can grant; used when revoking entitlements
pub const PLAN_GRANTED_MODULES: &[&str] = &[
    "reporting",
    "loyalty",
    "promotions",
    "api_access",
    "multi_location",
];

/// Feature flag set while a tenant has unpaid invoices
pub const PAST_DUE_FLAG: &str = "billing_past_due";

impl Plan {
    /// Modules this plan grants on top of the core set
    pub fn granted_modules(&self) -> &'static [&'static str] {
        match self {
            Plan::Starter => &["reporting"],
            Plan::Standard => &["reporting", "loyalty", "promotions"],
            Plan::Premium => &[
                "reporting",
                "loyalty",
                "promotions",
                "api_access",
                "multi_location",
            ],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Starter => "starter",
            Plan::Standard => "standard",
            Plan::Premium => "premium",
        }
    }
}

/// Terminal payment status carried by settlement producers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Completed,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Completed => "completed",
            SettlementStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(SettlementStatus::Completed),
            "failed" => Some(SettlementStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionActivated {
    pub tenant_id: Uuid,
    pub subscription_id: String,
    pub plan: Plan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPastDue {
    pub tenant_id: Uuid,
    pub subscription_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionCanceled {
    pub tenant_id: Uuid,
    pub subscription_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPlanChanged {
    pub tenant_id: Uuid,
    pub subscription_id: String,
    pub plan: Plan,
    #[serde(default)]
    pub previous_plan: Option<Plan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceCreated {
    pub tenant_id: Uuid,
    pub invoice_id: String,
    #[serde(default)]
    pub subscription_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoicePaymentSucceeded {
    pub tenant_id: Uuid,
    pub invoice_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoicePaymentFailed {
    pub tenant_id: Uuid,
    pub invoice_id: String,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Delayed settlement callback from the payment sandbox. One of the three
/// producers converging on the idempotent settlement transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSettled {
    pub tenant_id: Uuid,
    pub payment_id: Uuid,
    pub ticket_id: Uuid,
    pub status: SettlementStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// The closed tagged union of accepted webhook events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SandboxEvent {
    #[serde(rename = "subscription.activated")]
    SubscriptionActivated(SubscriptionActivated),
    #[serde(rename = "subscription.past_due")]
    SubscriptionPastDue(SubscriptionPastDue),
    #[serde(rename = "subscription.canceled")]
    SubscriptionCanceled(SubscriptionCanceled),
    #[serde(rename = "subscription.plan_changed")]
    SubscriptionPlanChanged(SubscriptionPlanChanged),
    #[serde(rename = "invoice.created")]
    InvoiceCreated(InvoiceCreated),
    #[serde(rename = "invoice.payment_succeeded")]
    InvoicePaymentSucceeded(InvoicePaymentSucceeded),
    #[serde(rename = "invoice.payment_failed")]
    InvoicePaymentFailed(InvoicePaymentFailed),
    #[serde(rename = "payment.settled")]
    PaymentSettled(PaymentSettled),
}

pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "subscription.activated",
    "subscription.past_due",
    "subscription.canceled",
    "subscription.plan_changed",
    "invoice.created",
    "invoice.payment_succeeded",
    "invoice.payment_failed",
    "payment.settled",
];

impl SandboxEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SandboxEvent::SubscriptionActivated(_) => "subscription.activated",
            SandboxEvent::SubscriptionPastDue(_) => "subscription.past_due",
            SandboxEvent::SubscriptionCanceled(_) => "subscription.canceled",
            SandboxEvent::SubscriptionPlanChanged(_) => "subscription.plan_changed",
            SandboxEvent::InvoiceCreated(_) => "invoice.created",
            SandboxEvent::InvoicePaymentSucceeded(_) => "invoice.payment_succeeded",
            SandboxEvent::InvoicePaymentFailed(_) => "invoice.payment_failed",
            SandboxEvent::PaymentSettled(_) => "payment.settled",
        }
    }

    pub fn tenant_id(&self) -> Uuid {
        match self {
            SandboxEvent::SubscriptionActivated(e) => e.tenant_id,
            SandboxEvent::SubscriptionPastDue(e) => e.tenant_id,
            SandboxEvent::SubscriptionCanceled(e) => e.tenant_id,
            SandboxEvent::SubscriptionPlanChanged(e) => e.tenant_id,
            SandboxEvent::InvoiceCreated(e) => e.tenant_id,
            SandboxEvent::InvoicePaymentSucceeded(e) => e.tenant_id,
            SandboxEvent::InvoicePaymentFailed(e) => e.tenant_id,
            SandboxEvent::PaymentSettled(e) => e.tenant_id,
        }
    }

    /// Schema-drift guard used by the rescue loop before re-queueing
    pub fn is_known_type(event_type: &str) -> bool {
        KNOWN_EVENT_TYPES.contains(&event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscription_activated() {
        let body = serde_json::json!({
            "type": "subscription.activated",
            "data": {
                "tenant_id": "0e3f9ad0-6f3b-4b87-9e0a-5f6f0c9b1a2d",
                "subscription_id": "sub_123",
                "plan": "premium"
            }
        });
        let event: SandboxEvent = serde_json::from_value(body).unwrap();
        match event {
            SandboxEvent::SubscriptionActivated(e) => {
                assert_eq!(e.plan, Plan::Premium);
                assert_eq!(e.subscription_id, "sub_123");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_event_type() {
        let body = serde_json::json!({"type": "unknown.event", "data": {}});
        assert!(serde_json::from_value::<SandboxEvent>(body).is_err());
    }

    #[test]
    fn rejects_malformed_data() {
        // plan outside the closed enum
        let body = serde_json::json!({
            "type": "subscription.activated",
            "data": {
                "tenant_id": "0e3f9ad0-6f3b-4b87-9e0a-5f6f0c9b1a2d",
                "subscription_id": "sub_123",
                "plan": "platinum"
            }
        });
        assert!(serde_json::from_value::<SandboxEvent>(body).is_err());
    }

    #[test]
    fn event_type_tags_round_trip() {
        let event = SandboxEvent::PaymentSettled(PaymentSettled {
            tenant_id: Uuid::new_v4(),
            payment_id: Uuid::new_v4(),
            ticket_id: Uuid::new_v4(),
            status: SettlementStatus::Completed,
            failure_reason: None,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "payment.settled");
        assert_eq!(value["data"]["status"], "completed");
        assert!(SandboxEvent::is_known_type(event.event_type()));
    }

    #[test]
    fn unknown_type_is_not_known() {
        assert!(!SandboxEvent::is_known_type("subscription.resurrected"));
    }

    #[test]
    fn plan_grants_are_subsets_of_granted_modules() {
        for plan in [Plan::Starter, Plan::Standard, Plan::Premium] {
            for module in plan.granted_modules() {
                assert!(
                    PLAN_GRANTED_MODULES.contains(module),
                    "{module} missing from PLAN_GRANTED_MODULES"
                );
            }
        }
    }

    #[test]
    fn premium_grants_superset_of_standard() {
        let standard = Plan::Standard.granted_modules();
        for module in standard {
            assert!(Plan::Premium.granted_modules().contains(module));
        }
    }
}
