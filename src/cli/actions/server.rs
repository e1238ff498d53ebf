use crate::{
    api,
    api::{email::EmailWorkerConfig, handlers::auth::AuthConfig},
    cli::actions::Action,
};
use anyhow::Result;

/// Handle the server action
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Server {
            port,
            dsn,
            access_token_secret,
            refresh_token_secret,
            frontend_url,
        } => {
            let auth_config =
                AuthConfig::new(access_token_secret, refresh_token_secret, frontend_url);

            api::new(port, dsn, auth_config, EmailWorkerConfig::new()).await?;
        }
    }

    Ok(())
}
