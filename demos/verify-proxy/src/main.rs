use clap::Parser;
use tokenshare::{
    config::KeyConfig, ClientCredentials, HttpClient, RedisTokenStore, RefreshScheduler,
    TokenConfig, TokenManager,
};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Parser)]
struct Opts {
    /// Redis instance shared by all instances of the service
    #[arg(long, env, default_value = "redis://127.0.0.1:6379/0")]
    redis_url: String,

    /// Base URL of the identity provider, serving `/v1/token/create` and `/v1/token/refresh`
    #[arg(long, env)]
    token_provider_url: Url,

    #[arg(long, env)]
    client_id: String,

    #[arg(long, env, hide_env_values = true)]
    client_secret: String,

    /// Base URL of the presentation verifier
    #[arg(long, env)]
    verifier_url: Url,

    #[arg(long, env, default_value = "vp:token:")]
    key_prefix: String,

    /// Print the token status as JSON instead of verifying a presentation
    #[arg(long)]
    status: bool,

    /// Keep refreshing tokens in the background until interrupted
    #[arg(long)]
    serve: bool,

    /// Presentation to verify
    presentation_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let token_provider_url = as_base(opts.token_provider_url);
    let verifier_url = as_base(opts.verifier_url);

    let config = TokenConfig::builder()
        .credentials(ClientCredentials::new(opts.client_id, opts.client_secret))
        .create_token_url(token_provider_url.join("v1/token/create")?)
        .refresh_token_url(token_provider_url.join("v1/token/refresh")?)
        .keys(KeyConfig::builder().key_prefix(opts.key_prefix).build())
        .build();
    let schedule = config.schedule;

    let cancel = CancellationToken::new();
    let store = RedisTokenStore::connect(&opts.redis_url).await?;
    let manager = TokenManager::builder(config, store)
        .set_cancellation_token(cancel.clone())
        .build()
        .await?;

    if opts.status {
        let status = manager.status().await?;
        println!("{}", serde_json::to_string_pretty(&status)?);
    }

    if let Some(id) = opts.presentation_id {
        let client = HttpClient::new(manager.clone());
        let response = client
            .get(verifier_url.join(&format!("v1/vp/verify/{id}"))?)
            .header("accept", "application/json")
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        println!("{status}\n{body}");
    }

    if opts.serve {
        let scheduler = RefreshScheduler::spawn(manager, schedule, cancel.clone());
        tracing::info!("Refreshing tokens in the background. Press Ctrl+C to stop.");
        tokio::signal::ctrl_c().await?;
        cancel.cancel();
        scheduler.shutdown().await;
    }

    Ok(())
}

/// `Url::join` replaces the last path segment unless the base ends with a slash.
fn as_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_keeps_its_path() {
        let base = as_base("https://idp.example.com/api".parse().unwrap());
        assert_eq!(
            base.join("v1/token/create").unwrap().as_str(),
            "https://idp.example.com/api/v1/token/create"
        );
        let base = as_base("https://idp.example.com/".parse().unwrap());
        assert_eq!(
            base.join("v1/token/create").unwrap().as_str(),
            "https://idp.example.com/v1/token/create"
        );
    }
}
