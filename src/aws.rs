//! AWS Cognito identity-pool authentication and the S3 object store used
//! by the export orchestrator. Temporary credentials are cached and
//! refreshed shortly before they expire.

use std::sync::{Arc, Mutex};

use aws_config::Region;
use aws_sdk_cognitoidentityprovider::types::AuthFlowType;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tracing::{debug, info};

use crate::config::AwsCognito;
use crate::error::{AnonymizerError, Result};

/// Refresh credentials when they expire within this many seconds.
const CREDENTIAL_REFRESH_MARGIN_SECS: i64 = 300;

struct Session {
    store: Arc<dyn ObjectStore>,
    /// Cognito user sub, used as the per-user S3 directory.
    user_directory: String,
    /// Unix timestamp the temporary credentials expire at.
    expiration: i64,
}

/// Blocking facade over the async AWS SDK and object store clients. One
/// instance is shared by all export workers.
pub struct AwsClient {
    settings: AwsCognito,
    runtime: tokio::runtime::Runtime,
    session: Mutex<Option<Session>>,
}

impl AwsClient {
    pub fn new(settings: AwsCognito) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| AnonymizerError::Config(format!("cannot start AWS runtime: {e}")))?;
        Ok(Self {
            settings,
            runtime,
            session: Mutex::new(None),
        })
    }

    /// Authenticates against the Cognito identity pool with the configured
    /// username and password, caching the resulting S3 session. Returns
    /// the user directory the bucket keys are rooted at.
    pub fn authenticate(&self) -> Result<String> {
        let mut guard = self.session.lock().unwrap();
        if let Some(session) = guard.as_ref() {
            let now = chrono::Utc::now().timestamp();
            if session.expiration - now >= CREDENTIAL_REFRESH_MARGIN_SECS {
                return Ok(session.user_directory.clone());
            }
            debug!("AWS credentials expiring, re-authenticating");
        }
        let session = self.runtime.block_on(self.cognito_login())?;
        let user_directory = session.user_directory.clone();
        *guard = Some(session);
        Ok(user_directory)
    }

    fn store(&self) -> Result<Arc<dyn ObjectStore>> {
        self.authenticate()?;
        let guard = self.session.lock().unwrap();
        guard
            .as_ref()
            .map(|s| Arc::clone(&s.store))
            .ok_or_else(|| AnonymizerError::CredentialsExpired("no AWS session".into()))
    }

    /// True when an object already exists at the key.
    pub fn object_exists(&self, key: &str) -> Result<bool> {
        let store = self.store()?;
        let path = ObjectPath::from(key);
        self.runtime.block_on(async move {
            match store.head(&path).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(AnonymizerError::CredentialsExpired(e.to_string())),
            }
        })
    }

    /// Uploads one object.
    pub fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let store = self.store()?;
        let path = ObjectPath::from(key);
        self.runtime.block_on(async move {
            store
                .put(&path, PutPayload::from(bytes))
                .await
                .map(|_| ())
                .map_err(|e| AnonymizerError::StorageError(format!("S3 put failed: {e}")))
        })
    }

    async fn cognito_login(&self) -> Result<Session> {
        let cfg = &self.settings;
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(cfg.region_name.clone()))
            .no_credentials()
            .load()
            .await;

        let idp = aws_sdk_cognitoidentityprovider::Client::new(&sdk_config);
        let auth = idp
            .initiate_auth()
            .client_id(&cfg.app_client_id)
            .auth_flow(AuthFlowType::UserPasswordAuth)
            .auth_parameters("USERNAME", &cfg.username)
            .auth_parameters("PASSWORD", &cfg.password)
            .send()
            .await
            .map_err(|e| AnonymizerError::CredentialsExpired(format!("Cognito auth failed: {e}")))?;

        let result = auth.authentication_result().ok_or_else(|| {
            AnonymizerError::CredentialsExpired("no authentication result in response".into())
        })?;
        let id_token = result
            .id_token()
            .ok_or_else(|| AnonymizerError::CredentialsExpired("no id token in response".into()))?
            .to_string();
        let access_token = result
            .access_token()
            .ok_or_else(|| {
                AnonymizerError::CredentialsExpired("no access token in response".into())
            })?
            .to_string();

        // The user's sub attribute names the per-user bucket directory.
        let user = idp
            .get_user()
            .access_token(&access_token)
            .send()
            .await
            .map_err(|e| AnonymizerError::CredentialsExpired(format!("Cognito get_user: {e}")))?;
        let user_directory = user
            .user_attributes()
            .iter()
            .find(|attr| attr.name() == "sub")
            .and_then(|attr| attr.value())
            .ok_or_else(|| {
                AnonymizerError::CredentialsExpired("user has no 'sub' attribute".into())
            })?
            .to_string();

        // Exchange the token through the identity pool for temporary keys.
        let identity = aws_sdk_cognitoidentity::Client::new(&sdk_config);
        let provider = format!(
            "cognito-idp.{}.amazonaws.com/{}",
            cfg.region_name, cfg.user_pool_id
        );
        let identity_id = identity
            .get_id()
            .identity_pool_id(&cfg.identity_pool_id)
            .account_id(&cfg.account_id)
            .logins(&provider, &id_token)
            .send()
            .await
            .map_err(|e| AnonymizerError::CredentialsExpired(format!("Cognito get_id: {e}")))?
            .identity_id()
            .ok_or_else(|| AnonymizerError::CredentialsExpired("no identity id".into()))?
            .to_string();
        let creds = identity
            .get_credentials_for_identity()
            .identity_id(identity_id)
            .logins(&provider, &id_token)
            .send()
            .await
            .map_err(|e| {
                AnonymizerError::CredentialsExpired(format!("Cognito credentials: {e}"))
            })?;
        let creds = creds.credentials().ok_or_else(|| {
            AnonymizerError::CredentialsExpired("no credentials in response".into())
        })?;

        let access_key = creds
            .access_key_id()
            .ok_or_else(|| AnonymizerError::CredentialsExpired("no access key".into()))?;
        let secret_key = creds
            .secret_key()
            .ok_or_else(|| AnonymizerError::CredentialsExpired("no secret key".into()))?;
        let session_token = creds
            .session_token()
            .ok_or_else(|| AnonymizerError::CredentialsExpired("no session token".into()))?;
        let expiration = creds
            .expiration()
            .map(|dt| dt.secs())
            .unwrap_or_else(|| chrono::Utc::now().timestamp());

        let store = AmazonS3Builder::new()
            .with_bucket_name(&cfg.s3_bucket)
            .with_region(&cfg.region_name)
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key)
            .with_token(session_token)
            .build()
            .map_err(|e| AnonymizerError::Config(format!("cannot build S3 store: {e}")))?;

        info!(expiration, "AWS authentication successful");
        Ok(Session {
            store: Arc::new(store),
            user_directory,
            expiration,
        })
    }
}
