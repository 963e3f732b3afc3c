// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Pipelines
//!
//! Tests critical boundary conditions in:
//! - Event validation (EVT-01 to EVT-07)
//! - Settlement status handling (SET-01 to SET-04)
//! - Queue job payloads (JOB-01 to JOB-03)

#[cfg(test)]
mod event_validation_tests {
    use crate::events::*;

    // =========================================================================
    // EVT-01: Missing type field - rejected
    // =========================================================================
    #[test]
    fn test_missing_type_rejected() {
        let body = serde_json::json!({"data": {}});
        assert!(serde_json::from_value::<SandboxEvent>(body).is_err());
    }

    // =========================================================================
    // EVT-02: Tag is case sensitive
    // =========================================================================
    #[test]
    fn test_tag_case_sensitive() {
        let body = serde_json::json!({
            "type": "Subscription.Activated",
            "data": {
                "tenant_id": "0e3f9ad0-6f3b-4b87-9e0a-5f6f0c9b1a2d",
                "subscription_id": "sub_1",
                "plan": "starter"
            }
        });
        assert!(serde_json::from_value::<SandboxEvent>(body).is_err());
    }

    // =========================================================================
    // EVT-03: Null data for a kind with required fields - rejected
    // =========================================================================
    #[test]
    fn test_null_data_rejected() {
        let body = serde_json::json!({"type": "invoice.created", "data": null});
        assert!(serde_json::from_value::<SandboxEvent>(body).is_err());
    }

    // =========================================================================
    // EVT-04: Non-uuid tenant id - rejected
    // =========================================================================
    #[test]
    fn test_bad_tenant_id_rejected() {
        let body = serde_json::json!({
            "type": "subscription.past_due",
            "data": {"tenant_id": "tenant-42", "subscription_id": "sub_1"}
        });
        assert!(serde_json::from_value::<SandboxEvent>(body).is_err());
    }

    // =========================================================================
    // EVT-05: Extra unknown fields in data are tolerated
    // =========================================================================
    // The provider adds fields over time; the union only requires what the
    // effect engine consumes.
    #[test]
    fn test_extra_fields_tolerated() {
        let body = serde_json::json!({
            "type": "invoice.payment_succeeded",
            "data": {
                "tenant_id": "0e3f9ad0-6f3b-4b87-9e0a-5f6f0c9b1a2d",
                "invoice_id": "inv_7",
                "collection_method": "charge_automatically"
            }
        });
        let event: SandboxEvent = serde_json::from_value(body).unwrap();
        assert_eq!(event.event_type(), "invoice.payment_succeeded");
    }

    // =========================================================================
    // EVT-06: Optional fields default to None
    // =========================================================================
    #[test]
    fn test_optional_failure_reason_defaults() {
        let body = serde_json::json!({
            "type": "invoice.payment_failed",
            "data": {
                "tenant_id": "0e3f9ad0-6f3b-4b87-9e0a-5f6f0c9b1a2d",
                "invoice_id": "inv_7"
            }
        });
        let event: SandboxEvent = serde_json::from_value(body).unwrap();
        match event {
            SandboxEvent::InvoicePaymentFailed(e) => assert!(e.failure_reason.is_none()),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    // =========================================================================
    // EVT-07: Downgrade revokes modules the new plan does not grant
    // =========================================================================
    #[test]
    fn test_downgrade_revokes_premium_modules() {
        let starter = Plan::Starter.granted_modules();
        for module in Plan::Premium.granted_modules() {
            if !starter.contains(module) {
                // These are exactly the modules set_plan_modules disables
                assert!(PLAN_GRANTED_MODULES.contains(module));
            }
        }
        assert!(!starter.contains(&"api_access"));
        assert!(!starter.contains(&"loyalty"));
    }
}

#[cfg(test)]
mod settlement_tests {
    use crate::events::SettlementStatus;

    // =========================================================================
    // SET-01: Only the two terminal statuses parse
    // =========================================================================
    #[test]
    fn test_parse_terminal_statuses() {
        assert_eq!(
            SettlementStatus::parse("completed"),
            Some(SettlementStatus::Completed)
        );
        assert_eq!(
            SettlementStatus::parse("failed"),
            Some(SettlementStatus::Failed)
        );
    }

    // =========================================================================
    // SET-02: Pending is not a settlement target
    // =========================================================================
    #[test]
    fn test_pending_is_not_terminal() {
        assert_eq!(SettlementStatus::parse("pending"), None);
        assert_eq!(SettlementStatus::parse(""), None);
        assert_eq!(SettlementStatus::parse("COMPLETED"), None);
    }

    // =========================================================================
    // SET-03: Wire form matches the payments table status column
    // =========================================================================
    #[test]
    fn test_wire_form_round_trips() {
        for status in [SettlementStatus::Completed, SettlementStatus::Failed] {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, status.as_str());
            let back: SettlementStatus = serde_json::from_value(json).unwrap();
            assert_eq!(back, status);
        }
    }

    // =========================================================================
    // SET-04: payment.settled carries a parseable terminal status
    // =========================================================================
    #[test]
    fn test_payment_settled_rejects_pending_status() {
        let body = serde_json::json!({
            "type": "payment.settled",
            "data": {
                "tenant_id": "0e3f9ad0-6f3b-4b87-9e0a-5f6f0c9b1a2d",
                "payment_id": "31e0f4a8-2df1-43dd-b7b4-2a1f64f0a6c1",
                "ticket_id": "adbb6c11-31a0-4f8e-b6b3-cc8a4d5b9f0e",
                "status": "pending"
            }
        });
        assert!(serde_json::from_value::<crate::SandboxEvent>(body).is_err());
    }
}

#[cfg(test)]
mod queue_job_tests {
    use uuid::Uuid;

    use crate::events::SettlementStatus;
    use crate::payments::PaymentStatusJob;
    use crate::store::WebhookJob;

    // =========================================================================
    // JOB-01: Webhook job round trips through the queue envelope
    // =========================================================================
    #[test]
    fn test_webhook_job_round_trips() {
        let job = WebhookJob {
            event_id: Uuid::new_v4(),
            event_type: "subscription.activated".to_string(),
        };
        let json = serde_json::to_string(&job).unwrap();
        let back: WebhookJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_id, job.event_id);
        assert_eq!(back.event_type, job.event_type);
    }

    // =========================================================================
    // JOB-02: Payment job defaults failure_reason when absent
    // =========================================================================
    #[test]
    fn test_payment_job_failure_reason_defaults() {
        let json = serde_json::json!({
            "tenant_id": Uuid::new_v4(),
            "payment_id": Uuid::new_v4(),
            "ticket_id": Uuid::new_v4(),
            "processed_by": "scheduled_job",
            "target_status": "completed"
        });
        let job: PaymentStatusJob = serde_json::from_value(json).unwrap();
        assert!(job.failure_reason.is_none());
        assert_eq!(job.target_status, SettlementStatus::Completed);
    }

    // =========================================================================
    // JOB-03: Job ids are the entity ids (dedup keys)
    // =========================================================================
    // The enqueue sites key webhook jobs by event id and payment jobs by
    // payment id; this pins the string form both sides agree on.
    #[test]
    fn test_job_id_string_form() {
        let id = Uuid::new_v4();
        assert_eq!(id.to_string().len(), 36);
        assert_eq!(id.to_string(), format!("{id}"));
    }
}
