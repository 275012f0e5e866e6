use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use intakeflow::flows::builtin_flows;
use intakeflow::flows::db::MemoryStore;
use intakeflow::flows::sequencer::visible_steps;
use intakeflow::flows::session::{FlowSession, SessionOptions};
use intakeflow::flows::state::{AuthContext, BlockedReason, FlowError, Navigation};
use intakeflow::flows::submit::{CheckoutClient, CheckoutRequest, CheckoutResponse};
use intakeflow::flows::types::FlowVariant;

#[derive(Default)]
struct RecordingCheckout {
    seen: Mutex<Option<CheckoutRequest>>,
}

#[async_trait]
impl CheckoutClient for RecordingCheckout {
    async fn create_checkout(&self, request: &CheckoutRequest) -> anyhow::Result<CheckoutResponse> {
        *self.seen.lock().unwrap() = Some(request.clone());
        Ok(CheckoutResponse {
            success: true,
            checkout_url: Some("https://pay.example/cert/1".into()),
            error: None,
        })
    }
}

fn cert_session() -> FlowSession {
    let def = Arc::new(builtin_flows().unwrap()["medical_certificate"].clone());
    FlowSession::new(def, Arc::new(MemoryStore::new()), SessionOptions::default())
}

fn fill_details(s: &mut FlowSession, auth: &AuthContext) {
    s.set_answer("certificate_type", "carer").unwrap();
    s.next(auth).unwrap();
    s.set_answer("start_date", "2026-10-14").unwrap();
    s.set_answer("duration", "2 days").unwrap();
    s.next(auth).unwrap();
    s.set_answer("symptoms", vec!["fever".to_string(), "cough".to_string()])
        .unwrap();
    s.next(auth).unwrap();
    s.set_answer("notes", "Looking after my daughter").unwrap();
    s.next(auth).unwrap();
    assert_eq!(s.instance().current_step(), "safety");
}

#[test]
fn certificate_definition_shape() {
    let flows = builtin_flows().unwrap();
    let def = &flows["medical_certificate"];
    assert_eq!(def.variant, FlowVariant::MedicalCertificate);
    assert!(def.gating.is_empty());
    assert_eq!(
        visible_steps(def, &AuthContext::signed_in("p", false)),
        vec!["type", "dates", "symptoms", "notes", "safety", "review", "payment"]
    );
    let progress = def.progress("dates").unwrap();
    assert_eq!(progress.stage, "Details");
    assert_eq!(progress.stage_index, 0);
    assert_eq!(progress.minutes_remaining, 6);
}

#[tokio::test]
async fn onboarding_patient_completes_certificate() {
    let mut s = cert_session();
    let auth = AuthContext::signed_in("patient-9", true);
    s.mount();
    fill_details(&mut s, &auth);

    for field in ["emergency_symptoms", "mental_health_crisis"] {
        s.set_answer(field, false).unwrap();
    }
    // Answering yes to a non-knockout question is fine.
    assert_eq!(s.set_answer("contagious", true).unwrap(), None);
    s.next(&auth).unwrap();
    assert_eq!(s.instance().current_step(), "medicare");

    s.set_answer("medicare_number", "2123456709").unwrap();
    s.set_answer("medicare_irn", "2").unwrap();
    s.set_answer("date_of_birth", "1990-02-28").unwrap();
    s.next(&auth).unwrap();
    assert_eq!(s.instance().current_step(), "signup");
    s.next(&auth).unwrap();
    s.next(&auth).unwrap();
    assert_eq!(s.instance().current_step(), "payment");

    let client = RecordingCheckout::default();
    let url = s.submit(&auth, &client).await.unwrap();
    assert_eq!(url, "https://pay.example/cert/1");

    let req = client.seen.lock().unwrap().clone().unwrap();
    assert_eq!(req.category, "medical_certificate");
    assert_eq!(req.subtype, "carer");
    assert_eq!(req.kind, "med_cert");
    assert_eq!(req.answers["symptoms"], serde_json::json!(["fever", "cough"]));
    assert_eq!(req.answers["medicare_number"], "2123456709");
}

#[test]
fn knockout_blocks_until_cleared() {
    tokio_test::block_on(async {
        let mut s = cert_session();
        let auth = AuthContext::anonymous();
        s.mount();
        fill_details(&mut s, &auth);

        s.set_answer("mental_health_crisis", false).unwrap();
        s.set_answer("contagious", false).unwrap();
        assert_eq!(
            s.set_answer("emergency_symptoms", true).unwrap(),
            Some(BlockedReason::SafetyKnockout)
        );
        assert_eq!(
            s.next(&auth).unwrap_err(),
            FlowError::Blocked(BlockedReason::SafetyKnockout)
        );
        let def = s.instance().definition();
        assert!(def.knockout_resource.is_some());

        // Back stays available from the blocking screen.
        assert!(matches!(s.back(&auth).unwrap(), Navigation::Moved { .. }));
        assert_eq!(s.instance().current_step(), "notes");
        assert!(s.next(&auth).is_err());

        assert_eq!(s.set_answer("emergency_symptoms", false).unwrap(), None);
        tokio_test::assert_ok!(s.next(&auth));
        assert_eq!(s.instance().current_step(), "safety");
        tokio_test::assert_ok!(s.next(&auth));
        assert_eq!(s.instance().current_step(), "medicare");
    });
}

#[tokio::test]
async fn embedded_auth_jumps_to_review() {
    let mut s = cert_session();
    let anon = AuthContext::anonymous();
    s.mount();
    fill_details(&mut s, &anon);
    for field in ["emergency_symptoms", "mental_health_crisis", "contagious"] {
        s.set_answer(field, false).unwrap();
    }
    s.next(&anon).unwrap();
    s.set_answer("medicare_number", "2123 45670 9").unwrap();
    s.set_answer("medicare_irn", "1").unwrap();
    s.set_answer("date_of_birth", "1979-12-01").unwrap();
    s.next(&anon).unwrap();
    assert_eq!(s.instance().current_step(), "signup");

    assert_eq!(
        s.complete_auth("patient-10", "profile-10").unwrap(),
        Navigation::Moved {
            from: "signup".into(),
            to: "review".into()
        }
    );

    // A returning patient with a profile now skips medicare and signup going back.
    let auth = AuthContext::signed_in("patient-10", false);
    s.back(&auth).unwrap();
    assert_eq!(s.instance().current_step(), "safety");
}
