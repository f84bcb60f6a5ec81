//! End-to-end coverage for the admission race described in spec
//! scenario 1: a second connection using the same name (any casing)
//! is rejected while the first is still registered.

mod common;

use common::TestHub;
use relaychat_hub::admission::{self, Admitted};
use relaychat_hub::error::AdmissionError;
use relaychat_hub::message::Handshake;
use tokio::sync::{mpsc, oneshot};

#[tokio::test]
async fn duplicate_name_is_rejected_case_insensitively_while_first_is_registered() {
    let test_hub = TestHub::new().await;

    let alice_hs = Handshake {
        username: "alice".to_string(),
        admin: false,
        admin_key: None,
    };
    let existing = test_hub.handle.usernames().await;
    let Admitted { username, is_admin } =
        admission::admit(&alice_hs, &test_hub.config, &test_hub.handle, &existing)
            .await
            .unwrap();

    let (tx, _rx) = mpsc::channel(256);
    let (close_tx, _close_rx) = oneshot::channel();
    test_hub.handle.register(1, username.clone(), is_admin, tx, close_tx).await;
    // Give the Hub actor a turn to process the register command.
    tokio::task::yield_now().await;

    let bob_as_alice = Handshake {
        username: "ALICE".to_string(),
        admin: false,
        admin_key: None,
    };
    let existing = test_hub.handle.usernames().await;
    assert_eq!(existing, vec!["alice".to_string()]);

    let err = admission::admit(&bob_as_alice, &test_hub.config, &test_hub.handle, &existing)
        .await
        .unwrap_err();
    assert_eq!(err, AdmissionError::UsernameTaken);

    // The original registrant is unaffected and still the sole member
    // of the user-list.
    assert_eq!(test_hub.handle.usernames().await, vec!["alice".to_string()]);
}
