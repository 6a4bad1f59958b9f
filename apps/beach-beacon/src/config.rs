use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;

use crate::push::FcmConfig;
use crate::router::RoutingPolicy;

#[derive(Debug, Parser)]
#[command(
    name = "beach-beacon",
    author,
    version,
    about = "Call signaling relay with push wake-up for backgrounded responders"
)]
pub struct Cli {
    /// Interface to bind the websocket listener to.
    #[arg(long, env = "BEACH_BEACON_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// How answers and ICE candidates find their counterpart.
    #[arg(
        long,
        env = "BEACH_BEACON_ROUTING_POLICY",
        value_enum,
        default_value_t = RoutingPolicy::Paired
    )]
    pub routing_policy: RoutingPolicy,

    /// Google service-account key used for FCM delivery. Push is disabled
    /// when unset.
    #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS")]
    pub fcm_service_account: Option<PathBuf>,

    /// Firebase project id; defaults to the service account's project.
    #[arg(long, env = "FCM_PROJECT_ID")]
    pub fcm_project_id: Option<String>,

    /// Notification title shown on the responder's device.
    #[arg(long, env = "BEACH_BEACON_PUSH_TITLE", default_value = "Incoming call")]
    pub push_title: String,

    /// Notification body shown on the responder's device.
    #[arg(
        long,
        env = "BEACH_BEACON_PUSH_BODY",
        default_value = "Someone is calling you"
    )]
    pub push_body: String,

    /// Timeout for each request to the push provider.
    #[arg(long, env = "BEACH_BEACON_PUSH_TIMEOUT_SECS", default_value_t = 10)]
    pub push_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_BEACON_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub routing_policy: RoutingPolicy,
    pub fcm_service_account: Option<PathBuf>,
    pub fcm: FcmConfig,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let host: IpAddr = cli
            .host
            .parse()
            .with_context(|| format!("invalid listen host: {}", cli.host))?;
        let fcm = FcmConfig {
            project_id: cli.fcm_project_id.filter(|id| !id.trim().is_empty()),
            title: cli.push_title,
            body: cli.push_body,
            request_timeout: Duration::from_secs(cli.push_timeout_secs),
            ..FcmConfig::default()
        };

        Ok(Config {
            listen_addr: SocketAddr::new(host, cli.port),
            routing_policy: cli.routing_policy,
            fcm_service_account: cli.fcm_service_account,
            fcm,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            routing_policy: RoutingPolicy::Paired,
            fcm_service_account: None,
            fcm: FcmConfig::default(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn declared_default(name: &str) -> Option<String> {
        let command = Cli::command();
        let arg = command
            .get_arguments()
            .find(|arg| arg.get_id().as_str() == name)
            .unwrap_or_else(|| panic!("no argument {name}"));
        arg.get_default_values()
            .first()
            .map(|value| value.to_string_lossy().into_owned())
    }

    #[test]
    fn defaults_listen_on_port_3000() {
        assert_eq!(declared_default("host").as_deref(), Some("0.0.0.0"));
        assert_eq!(declared_default("port").as_deref(), Some("3000"));
        assert_eq!(declared_default("routing_policy").as_deref(), Some("paired"));
        assert_eq!(declared_default("push_title").as_deref(), Some("Incoming call"));
        assert_eq!(declared_default("fcm_service_account"), None);

        let config = Config::default();
        assert_eq!(config.listen_addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.routing_policy, RoutingPolicy::Paired);
        assert!(config.fcm_service_account.is_none());
        assert_eq!(config.fcm.title, "Incoming call");
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::try_parse_from([
            "beach-beacon",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--routing-policy",
            "broadcast",
            "--fcm-service-account",
            "/etc/beacon/sa.json",
            "--fcm-project-id",
            "calls-prod",
        ])
        .unwrap();
        let config = Config::try_from(cli).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.routing_policy, RoutingPolicy::Broadcast);
        assert_eq!(
            config.fcm_service_account,
            Some(PathBuf::from("/etc/beacon/sa.json"))
        );
        assert_eq!(config.fcm.project_id.as_deref(), Some("calls-prod"));
    }

    #[test]
    fn rejects_bad_host() {
        let cli = Cli::try_parse_from(["beach-beacon", "--host", "not-an-ip"]).unwrap();
        assert!(Config::try_from(cli).is_err());
    }
}
