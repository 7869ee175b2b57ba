//! Authentication and authorization entry point for client devices.
//!
//! Certificates issued by the gateway's own CA belong to local components
//! and receive the [`ALLOW_ALL_SESSION`] pseudo-session, which is never
//! stored and is authorized for everything. Every other certificate must be
//! reported active by the identity source of truth.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::certificate::helper::{certificate_hash, is_issued_by};
use crate::certificate::store::CertificateStore;
use crate::iot::{Certificate, IotAuthClient, Thing};
use crate::policy::{GroupManager, is_authorized};
use crate::session::{Session, SessionManager};
use crate::{Error, Result};

/// Session id granted to certificates issued by the local CA.
pub const ALLOW_ALL_SESSION: &str = "ALLOW_ALL";

/// A request to perform `operation` on `resource`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    /// Operation, e.g. `mqtt:publish`.
    pub operation: String,
    /// Resource, e.g. `mqtt:topic:telemetry`.
    pub resource: String,
    /// Session returned by [`DeviceAuthClient::create_session`].
    pub session_id: String,
    /// Protocol-level client id, for logging.
    pub client_id: String,
}

/// Device authentication and authorization façade.
pub struct DeviceAuthClient {
    sessions: Arc<SessionManager>,
    groups: Arc<GroupManager>,
    store: Arc<CertificateStore>,
    iot_client: Arc<dyn IotAuthClient>,
}

impl DeviceAuthClient {
    /// Create the façade over its collaborators.
    #[must_use]
    pub fn new(
        sessions: Arc<SessionManager>,
        groups: Arc<GroupManager>,
        store: Arc<CertificateStore>,
        iot_client: Arc<dyn IotAuthClient>,
    ) -> Self {
        Self {
            sessions,
            groups,
            store,
            iot_client,
        }
    }

    /// Authenticate a device by its certificate chain and return a session
    /// id.
    ///
    /// # Errors
    ///
    /// Returns `Error::Authentication` if the certificate is not issued by
    /// the local CA and the identity source of truth either does not report
    /// it active or cannot be reached.
    pub async fn create_session(&self, certificate_pem: &str) -> Result<String> {
        if self.is_local_component(certificate_pem) {
            debug!("Certificate issued by local CA, granting component session");
            return Ok(ALLOW_ALL_SESSION.to_string());
        }

        let certificate_id = self
            .iot_client
            .get_active_certificate_id(certificate_pem)
            .await
            .map_err(|e| {
                warn!(error = %e, "Unable to verify certificate with cloud");
                Error::Authentication("Failed to verify certificate with cloud".into())
            })?
            .ok_or_else(|| Error::Authentication("Certificate isn't active".into()))?;

        let hash = certificate_hash(certificate_pem);
        if let Err(e) = self
            .store
            .device_certificates()
            .store_device_certificate_if_absent(&hash, certificate_pem)
        {
            warn!(certificate_hash = %hash, error = %e, "Failed to cache device certificate");
        }

        let session_id = self
            .sessions
            .create_session(Session::for_certificate(Certificate::active(hash, certificate_id)));
        info!(session_id = %session_id, "Created device session");
        Ok(session_id)
    }

    fn is_local_component(&self, certificate_pem: &str) -> bool {
        let chain = self.store.ca_chain_pems();
        !chain.is_empty() && is_issued_by(certificate_pem, &chain.concat())
    }

    /// Associate `thing_name` with the session's certificate.
    ///
    /// The association is checked at most once per session; its result,
    /// positive or negative, is kept for the session's lifetime.
    ///
    /// # Errors
    ///
    /// Returns `Error::Authentication` for an unknown session, an invalid
    /// thing name, or when the identity source of truth cannot be reached.
    pub async fn attach_thing(&self, session_id: &str, thing_name: &str) -> Result<()> {
        if session_id == ALLOW_ALL_SESSION {
            return Ok(());
        }
        let session = self
            .sessions
            .find_session(session_id)
            .ok_or_else(|| Error::Authentication(format!("Invalid session ID ({session_id})")))?;
        let Some(certificate) = session.certificate() else {
            return Ok(());
        };
        let thing = Thing::of(thing_name)?;

        let attached = session
            .get_or_attach_thing(|| async {
                let attached = self
                    .iot_client
                    .is_thing_attached_to_certificate(&thing, certificate)
                    .await
                    .map_err(|e| {
                        warn!(thing = %thing_name, error = %e, "Unable to verify thing with cloud");
                        Error::Authentication("Failed to verify thing identity with cloud".into())
                    })?;
                Ok::<_, Error>(attached.then(|| thing.clone()))
            })
            .await?;

        match attached {
            Some(t) if t.thing_name() == thing_name => {
                debug!(session_id = %session_id, thing = %thing_name, "Thing attached to session");
            }
            Some(t) => debug!(
                session_id = %session_id,
                thing = %t.thing_name(),
                requested = %thing_name,
                "Session already has a different thing attached"
            ),
            None => debug!(
                session_id = %session_id,
                thing = %thing_name,
                "Thing is not attached to session certificate"
            ),
        }
        Ok(())
    }

    /// Whether the session may perform the requested operation.
    ///
    /// # Errors
    ///
    /// Returns `Error::Authorization` if the session id is unknown.
    pub fn can_device_perform(&self, request: &AuthorizationRequest) -> Result<bool> {
        if request.session_id == ALLOW_ALL_SESSION {
            return Ok(true);
        }
        let session = self.sessions.find_session(&request.session_id).ok_or_else(|| {
            Error::Authorization(format!(
                "Invalid session ID ({})",
                request.session_id
            ))
        })?;

        let permissions = self.groups.get_applicable_policy_permissions(&session);
        let allowed = is_authorized(&request.operation, &request.resource, &permissions);
        debug!(
            session_id = %request.session_id,
            client_id = %request.client_id,
            operation = %request.operation,
            resource = %request.resource,
            allowed,
            "Authorization decision"
        );
        Ok(allowed)
    }

    /// Close a session.
    ///
    /// # Errors
    ///
    /// Returns `Error::Authorization` if the session id is unknown.
    pub fn close_session(&self, session_id: &str) -> Result<()> {
        if session_id == ALLOW_ALL_SESSION {
            return Ok(());
        }
        self.sessions.close_session(session_id).map_err(|e| match e {
            Error::SessionNotFound(msg) => Error::Authorization(msg),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Duration;

    use super::*;
    use crate::certificate::generator::CertificateType;
    use crate::certificate::helper::{KeyType, LeafRequest, generate_key_pair, issue_ca, issue_leaf};
    use crate::iot::InMemoryIotRegistry;
    use crate::policy::{DeviceGroupsConfig, GroupDefinition, PolicyStatement};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(86_400);

    struct Fixture {
        client: DeviceAuthClient,
        registry: Arc<InMemoryIotRegistry>,
        store: Arc<CertificateStore>,
        sessions: Arc<SessionManager>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CertificateStore::new(dir.path()));
        let registry = Arc::new(InMemoryIotRegistry::new());
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&registry) as Arc<dyn IotAuthClient>,
            store.device_certificates(),
        ));
        let groups = Arc::new(GroupManager::new());
        groups.apply(&publish_own_topic()).unwrap();
        let client = DeviceAuthClient::new(
            Arc::clone(&sessions),
            groups,
            Arc::clone(&store),
            Arc::clone(&registry) as Arc<dyn IotAuthClient>,
        );
        Fixture {
            client,
            registry,
            store,
            sessions,
            _dir: dir,
        }
    }

    fn publish_own_topic() -> DeviceGroupsConfig {
        DeviceGroupsConfig {
            definitions: BTreeMap::from([(
                "devices".to_string(),
                GroupDefinition {
                    selection_rule: "thingName: *".into(),
                    policy_name: "own".into(),
                },
            )]),
            policies: BTreeMap::from([(
                "own".to_string(),
                BTreeMap::from([(
                    "publish".to_string(),
                    PolicyStatement {
                        operations: BTreeSet::from(["mqtt:publish".to_string()]),
                        resources: BTreeSet::from([
                            "mqtt:topic:${iot:Connection.Thing.ThingName}/#".to_string(),
                        ]),
                        ..PolicyStatement::default()
                    },
                )]),
            )]),
            ..DeviceGroupsConfig::default()
        }
    }

    fn device_certificate() -> String {
        let ca = issue_ca("Device CA", KeyType::EcdsaP256, DAY).unwrap();
        let key = generate_key_pair(KeyType::EcdsaP256).unwrap();
        issue_leaf(
            &LeafRequest {
                common_name: "device",
                certificate_type: CertificateType::Client,
                subject_alt_names: &[],
                validity: DAY,
            },
            &key,
            &ca.certificate_pem,
            &ca.private_key_pem,
        )
        .unwrap()
    }

    fn request(session_id: &str, resource: &str) -> AuthorizationRequest {
        AuthorizationRequest {
            operation: "mqtt:publish".into(),
            resource: resource.into(),
            session_id: session_id.into(),
            client_id: "client".into(),
        }
    }

    #[tokio::test]
    async fn active_certificate_gets_session_and_is_cached_on_disk() {
        // GIVEN
        let f = fixture();
        let pem = device_certificate();
        f.registry.register_certificate(&pem, "cert-1");

        // WHEN
        let session_id = f.client.create_session(&pem).await.unwrap();

        // THEN
        assert_ne!(session_id, ALLOW_ALL_SESSION);
        let session = f.sessions.find_session(&session_id).unwrap();
        assert_eq!(session.certificate().unwrap().certificate_id, "cert-1");
        let cached = f
            .store
            .device_certificates()
            .load_device_certificate(&certificate_hash(&pem))
            .unwrap();
        assert_eq!(cached.as_deref(), Some(pem.as_str()));
    }

    #[tokio::test]
    async fn inactive_or_unverifiable_certificate_is_rejected() {
        let f = fixture();
        let pem = device_certificate();

        let err = f.client.create_session(&pem).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(ref m) if m == "Certificate isn't active"));

        f.registry.register_certificate(&pem, "cert-1");
        f.registry.set_offline(true);
        let err = f.client.create_session(&pem).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(ref m) if m == "Failed to verify certificate with cloud"));
        assert_eq!(f.sessions.session_count(), 0);
    }

    #[tokio::test]
    async fn certificate_from_local_ca_gets_allow_all_session() {
        // GIVEN: a CA and a client certificate it issued
        let f = fixture();
        f.store.update(KeyType::EcdsaP256).unwrap();
        let ca = f.store.ca_material().unwrap();
        let key = generate_key_pair(KeyType::EcdsaP256).unwrap();
        let pem = issue_leaf(
            &LeafRequest {
                common_name: "broker",
                certificate_type: CertificateType::Client,
                subject_alt_names: &[],
                validity: DAY,
            },
            &key,
            ca.certificate_pem(),
            ca.private_key_pem(),
        )
        .unwrap();

        // WHEN
        let session_id = f.client.create_session(&pem).await.unwrap();

        // THEN: no cloud call, no stored session, everything allowed
        assert_eq!(session_id, ALLOW_ALL_SESSION);
        assert_eq!(f.registry.certificate_lookups(), 0);
        assert_eq!(f.sessions.session_count(), 0);
        assert!(f.client.can_device_perform(&request(ALLOW_ALL_SESSION, "mqtt:topic:x")).unwrap());
        f.client.attach_thing(ALLOW_ALL_SESSION, "anything").await.unwrap();
    }

    #[tokio::test]
    async fn attached_thing_drives_authorization() {
        // GIVEN
        let f = fixture();
        let pem = device_certificate();
        f.registry.register_certificate(&pem, "cert-1");
        f.registry.attach_thing("sensor", "cert-1");
        let session_id = f.client.create_session(&pem).await.unwrap();

        // WHEN: before attaching, no group matches
        assert!(!f.client.can_device_perform(&request(&session_id, "mqtt:topic:sensor/t")).unwrap());
        f.client.attach_thing(&session_id, "sensor").await.unwrap();

        // THEN
        assert!(f.client.can_device_perform(&request(&session_id, "mqtt:topic:sensor/t")).unwrap());
        assert!(!f.client.can_device_perform(&request(&session_id, "mqtt:topic:other/t")).unwrap());
    }

    #[tokio::test]
    async fn negative_thing_association_is_not_rechecked() {
        let f = fixture();
        let pem = device_certificate();
        f.registry.register_certificate(&pem, "cert-1");
        let session_id = f.client.create_session(&pem).await.unwrap();

        f.client.attach_thing(&session_id, "sensor").await.unwrap();
        f.registry.attach_thing("sensor", "cert-1");
        f.client.attach_thing(&session_id, "sensor").await.unwrap();

        assert_eq!(f.registry.attachment_lookups(), 1);
        assert!(f.sessions.find_session(&session_id).unwrap().thing().is_none());
    }

    #[tokio::test]
    async fn cloud_outage_during_attach_is_authentication_error_and_retried() {
        let f = fixture();
        let pem = device_certificate();
        f.registry.register_certificate(&pem, "cert-1");
        f.registry.attach_thing("sensor", "cert-1");
        let session_id = f.client.create_session(&pem).await.unwrap();

        f.registry.set_offline(true);
        let err = f.client.attach_thing(&session_id, "sensor").await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));

        f.registry.set_offline(false);
        f.client.attach_thing(&session_id, "sensor").await.unwrap();
        assert!(f.sessions.find_session(&session_id).unwrap().thing().is_some());
    }

    #[tokio::test]
    async fn unknown_sessions_are_rejected() {
        let f = fixture();

        assert!(matches!(
            f.client.attach_thing("missing", "sensor").await,
            Err(Error::Authentication(_))
        ));
        assert!(matches!(
            f.client.can_device_perform(&request("missing", "mqtt:topic:a")),
            Err(Error::Authorization(_))
        ));
        assert!(matches!(f.client.close_session("missing"), Err(Error::Authorization(_))));
    }

    #[tokio::test]
    async fn closing_twice_fails_the_second_time() {
        let f = fixture();
        let pem = device_certificate();
        f.registry.register_certificate(&pem, "cert-1");
        let session_id = f.client.create_session(&pem).await.unwrap();

        f.client.close_session(&session_id).unwrap();
        assert!(matches!(f.client.close_session(&session_id), Err(Error::Authorization(_))));
    }
}
