//! Startup wiring: state assembly in standalone mode and the fatal
//! missing-credentials listing for a mandatory channel.

use porter_core::config::PorterConfig;

// The binary crate exposes no lib target, so these tests drive the same
// surfaces the binary uses: config validation plus the channel-router
// registration rules the gateway builds on.

#[test]
fn run_mode_validation() {
    let mut config = PorterConfig::default();
    assert!(config.validate_run_mode().is_ok());

    config.channels.run_mode = "workchat".into();
    assert!(config.validate_run_mode().is_ok());

    config.channels.run_mode = "carrier-pigeon".into();
    let err = config.validate_run_mode().unwrap_err();
    assert!(err.to_string().contains("carrier-pigeon"));
}

#[tokio::test]
async fn mandatory_unconfigured_channel_lists_missing_vars() {
    use porter_channels::{ChannelError, ChannelRouter};
    use porter_core::config::ChannelMode;
    use porter_workchat::{WorkchatAdapter, WorkchatConfig};
    use std::sync::Arc;

    let mut router = ChannelRouter::new();
    let adapter = Arc::new(WorkchatAdapter::with_config(WorkchatConfig::default()));
    let err = router
        .register(adapter, ChannelMode::Enabled)
        .await
        .unwrap_err();

    let ChannelError::NotConfigured { channel, missing } = err else {
        panic!("expected NotConfigured, got {err}");
    };
    assert_eq!(channel, "workchat");
    for var in [
        "WORKCHAT_CORP_ID",
        "WORKCHAT_CORP_SECRET",
        "WORKCHAT_AGENT_ID",
        "WORKCHAT_TOKEN",
    ] {
        assert!(missing.contains(&var.to_string()), "missing should list {var}");
    }
}

#[tokio::test]
async fn auto_mode_skips_unconfigured_channels() {
    use porter_channels::ChannelRouter;
    use porter_core::config::ChannelMode;
    use porter_workchat::{WorkchatAdapter, WorkchatConfig};
    use std::sync::Arc;

    let mut router = ChannelRouter::new();
    let registered = router
        .register(
            Arc::new(WorkchatAdapter::with_config(WorkchatConfig::default())),
            ChannelMode::Auto,
        )
        .await
        .unwrap();
    assert!(!registered);
    assert!(router.active_channels().is_empty());
}
