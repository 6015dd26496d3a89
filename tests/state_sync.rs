#![allow(non_snake_case)]
use fhe_spin::test_helpers::*;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn start__without_authorization_never_prompts() {
    let ctx = TestContext::new();
    let alice = TestContext::alice();
    // given
    ctx.chain().grant(&alice, 3, 0);
    let session = ctx.session();

    // when
    let initial = session.start().await;

    // then
    assert!(initial.is_none());
    assert_eq!(ctx.signer().prompt_count(), 0);
    assert_eq!(ctx.relayer().decrypt_calls(), 0);
    assert!(!session.has_cached_authorization());
}

#[tokio::test(start_paused = true)]
async fn notifications__burst_is_coalesced_into_one_reload() {
    let ctx = TestContext::new();
    let alice = TestContext::alice();
    // given
    let session = ctx.start_authorized().await;
    sleep(Duration::from_secs(5)).await;
    let reads_before = ctx.chain().bundle_reads();

    // when
    ctx.chain().grant(&alice, 1, 0);
    sleep(Duration::from_millis(50)).await;
    ctx.chain().grant(&alice, 1, 0);
    sleep(Duration::from_secs(2)).await;

    // then
    assert_eq!(ctx.chain().bundle_reads(), reads_before + 1);
    assert_eq!(session.snapshot().unwrap().spins, 2);
}

#[tokio::test(start_paused = true)]
async fn notifications__for_other_accounts_are_ignored() {
    let ctx = TestContext::new();
    // given
    let _session = ctx.start_authorized().await;
    sleep(Duration::from_secs(5)).await;
    let reads_before = ctx.chain().bundle_reads();

    // when
    ctx.chain().grant(&TestContext::bob(), 1, 0);
    sleep(Duration::from_secs(3)).await;

    // then
    assert_eq!(ctx.chain().bundle_reads(), reads_before);
}

#[tokio::test(start_paused = true)]
async fn refresh__unchanged_version_skips_decryption() {
    let ctx = TestContext::new();
    let alice = TestContext::alice();
    // given
    ctx.chain().grant(&alice, 1, 0);
    let session = ctx.start_authorized().await;
    let decrypts_before = ctx.relayer().decrypt_calls();

    // when
    let snapshot = session.refresh().await.unwrap();

    // then
    assert_eq!(snapshot.spins, 1);
    assert_eq!(ctx.relayer().decrypt_calls(), decrypts_before);
}

#[tokio::test(start_paused = true)]
async fn relayer_outage__keeps_last_snapshot_and_drops_authorization() {
    let ctx = TestContext::new();
    let alice = TestContext::alice();
    // given
    ctx.chain().grant(&alice, 1, 0);
    let session = ctx.start_authorized().await;
    ctx.relayer().fail_next(500);

    // when
    ctx.chain().grant(&alice, 1, 0);
    let during_outage = session.refresh().await.unwrap();

    // then
    assert_eq!(during_outage.spins, 1);
    assert!(!session.has_cached_authorization());

    // when
    sleep(Duration::from_millis(100)).await;
    session.authorize().await.unwrap();

    // then
    assert_eq!(session.snapshot().unwrap().spins, 2);
    assert_eq!(ctx.signer().prompt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn restart__reuses_persisted_authorization_without_prompting() {
    let mut ctx = TestContext::new();
    let alice = TestContext::alice();
    // given
    ctx.chain().grant(&alice, 4, 0);
    ctx.start_authorized().await;

    // when
    let session = ctx.restart();
    let restored = session.start().await;

    // then
    assert_eq!(restored.unwrap().spins, 4);
    assert!(session.has_cached_authorization());
    assert_eq!(ctx.signer().prompt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn refresh__racing_notification_collapses_to_one_batch() {
    let ctx = TestContext::new();
    let alice = TestContext::alice();
    // given
    let session = ctx.start_authorized().await;
    sleep(Duration::from_secs(5)).await;
    let decrypts_before = ctx.relayer().decrypt_calls();

    // when
    ctx.chain().grant(&alice, 1, 0);
    sleep(Duration::from_millis(50)).await;
    let manual = session.refresh().await;
    sleep(Duration::from_secs(3)).await;

    // then
    assert_eq!(ctx.relayer().decrypt_calls(), decrypts_before + 1);
    let version = ctx.chain().account(&alice).version;
    assert_eq!(manual.unwrap().version, version);
    assert_eq!(session.snapshot().unwrap().version, version);
    assert_eq!(session.snapshot().unwrap().spins, 1);
}
