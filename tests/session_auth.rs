//! Device session and authorization flow
//!
//! Drives the service through its public API with the in-memory identity
//! registry standing in for the cloud:
//! - session creation for active, inactive and local-CA certificates
//! - thing attachment and policy-variable resolution
//! - session close and reuse of closed ids
//! - refresh sweep closing sessions whose certificate was revoked

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use edge_trust::Error;
use edge_trust::certificate::helper::{KeyType, LeafRequest, generate_key_pair, issue_ca, issue_leaf};
use edge_trust::certificate::{CertificateType, FileKeyProvider};
use edge_trust::config::Config;
use edge_trust::device_auth::{ALLOW_ALL_SESSION, AuthorizationRequest};
use edge_trust::iot::{CaRegistrar, InMemoryIotRegistry, IotAuthClient};
use edge_trust::policy::{DeviceGroupsConfig, GroupDefinition, PolicyStatement};
use edge_trust::service::{ClientDevicesAuthService, Collaborators};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const DAY: Duration = Duration::from_secs(86_400);

struct Harness {
    service: ClientDevicesAuthService,
    registry: Arc<InMemoryIotRegistry>,
    _dir: TempDir,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(InMemoryIotRegistry::new());
    let mut config = Config {
        work_dir: dir.path().join("work"),
        device_groups: sensor_groups(),
        ..Config::default()
    };
    config.certificate_authority.ca_type = KeyType::EcdsaP256;

    let service = ClientDevicesAuthService::new(
        config,
        Collaborators {
            iot_client: Arc::clone(&registry) as Arc<dyn IotAuthClient>,
            ca_registrar: None::<Arc<dyn CaRegistrar>>,
            key_provider: Arc::new(FileKeyProvider),
        },
    )
    .unwrap();
    service.start().await.unwrap();

    Harness {
        service,
        registry,
        _dir: dir,
    }
}

/// Sensors may connect as themselves and publish under their own prefix.
fn sensor_groups() -> DeviceGroupsConfig {
    let statement = |operations: &[&str], resources: &[&str]| PolicyStatement {
        operations: operations.iter().map(ToString::to_string).collect(),
        resources: resources.iter().map(ToString::to_string).collect(),
        ..PolicyStatement::default()
    };
    DeviceGroupsConfig {
        definitions: BTreeMap::from([(
            "sensors".to_string(),
            GroupDefinition {
                selection_rule: "thingName: sensor-*".into(),
                policy_name: "sensorPolicy".into(),
            },
        )]),
        policies: BTreeMap::from([(
            "sensorPolicy".to_string(),
            BTreeMap::from([
                (
                    "connect".to_string(),
                    statement(
                        &["mqtt:connect"],
                        &["mqtt:clientId:${iot:Connection.Thing.ThingName}"],
                    ),
                ),
                (
                    "publish".to_string(),
                    statement(
                        &["mqtt:publish"],
                        &["mqtt:topic:sensors/${iot:Connection.Thing.ThingName}/#"],
                    ),
                ),
            ]),
        )]),
        ..DeviceGroupsConfig::default()
    }
}

fn device_certificate() -> String {
    let ca = issue_ca("Device Issuer", KeyType::EcdsaP256, DAY).unwrap();
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

fn request(session_id: &str, operation: &str, resource: &str) -> AuthorizationRequest {
    AuthorizationRequest {
        operation: operation.into(),
        resource: resource.into(),
        session_id: session_id.into(),
        client_id: "sensor-1".into(),
    }
}

#[tokio::test]
async fn sensor_is_authorized_for_its_own_resources_only() {
    // GIVEN: an active certificate attached to sensor-1
    let h = harness().await;
    let pem = device_certificate();
    h.registry.register_certificate(&pem, "cert-1");
    h.registry.attach_thing("sensor-1", "cert-1");
    let auth = h.service.device_auth();

    // WHEN
    let session_id = auth.create_session(&pem).await.unwrap();
    auth.attach_thing(&session_id, "sensor-1").await.unwrap();

    // THEN
    let allowed = |operation: &str, resource: &str| {
        auth.can_device_perform(&request(&session_id, operation, resource))
            .unwrap()
    };
    assert!(allowed("mqtt:connect", "mqtt:clientId:sensor-1"));
    assert!(allowed("mqtt:publish", "mqtt:topic:sensors/sensor-1/temperature"));
    assert!(allowed("mqtt:publish", "mqtt:topic:sensors/sensor-1"));
    assert!(!allowed("mqtt:connect", "mqtt:clientId:sensor-2"));
    assert!(!allowed("mqtt:publish", "mqtt:topic:sensors/sensor-2/temperature"));
    assert!(!allowed("mqtt:subscribe", "mqtt:topicfilter:sensors/sensor-1/#"));

    h.service.shutdown().await;
}

#[tokio::test]
async fn thing_outside_every_group_is_denied() {
    let h = harness().await;
    let pem = device_certificate();
    h.registry.register_certificate(&pem, "cert-1");
    h.registry.attach_thing("camera-1", "cert-1");
    let auth = h.service.device_auth();

    let session_id = auth.create_session(&pem).await.unwrap();
    auth.attach_thing(&session_id, "camera-1").await.unwrap();

    assert!(
        !auth
            .can_device_perform(&request(&session_id, "mqtt:connect", "mqtt:clientId:camera-1"))
            .unwrap()
    );
    h.service.shutdown().await;
}

#[tokio::test]
async fn unknown_certificate_cannot_open_a_session() {
    let h = harness().await;

    let err = h
        .service
        .device_auth()
        .create_session(&device_certificate())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Authentication(_)));
    assert_eq!(h.service.sessions().session_count(), 0);
    h.service.shutdown().await;
}

fn local_leaf(h: &Harness, certificate_type: CertificateType) -> String {
    let ca = h.service.certificates().store().ca_material().unwrap();
    let key = generate_key_pair(KeyType::EcdsaP256).unwrap();
    issue_leaf(
        &LeafRequest {
            common_name: "local-broker",
            certificate_type,
            subject_alt_names: &[],
            validity: DAY,
        },
        &key,
        ca.certificate_pem(),
        ca.private_key_pem(),
    )
    .unwrap()
}

#[tokio::test]
async fn certificate_from_local_ca_is_allowed_everything() {
    // GIVEN: a client certificate issued by the service's own CA
    let h = harness().await;
    let pem = local_leaf(&h, CertificateType::Client);

    // WHEN
    let session_id = h.service.device_auth().create_session(&pem).await.unwrap();

    // THEN
    assert_eq!(session_id, ALLOW_ALL_SESSION);
    assert!(
        h.service
            .device_auth()
            .can_device_perform(&request(&session_id, "mqtt:publish", "mqtt:topic:anything"))
            .unwrap()
    );
    assert_eq!(h.registry.certificate_lookups(), 0);
    h.service.shutdown().await;
}

#[tokio::test]
async fn server_certificate_from_local_ca_is_allowed_everything() {
    // GIVEN: a server certificate issued by the service's own CA
    let h = harness().await;
    let pem = local_leaf(&h, CertificateType::Server);

    // WHEN
    let session_id = h.service.device_auth().create_session(&pem).await.unwrap();

    // THEN: no EKU restriction applies to the local-component check
    assert_eq!(session_id, ALLOW_ALL_SESSION);
    assert_eq!(h.registry.certificate_lookups(), 0);
    h.service.shutdown().await;
}

#[tokio::test]
async fn closed_session_is_unknown_afterwards() {
    let h = harness().await;
    let pem = device_certificate();
    h.registry.register_certificate(&pem, "cert-1");
    let auth = h.service.device_auth();
    let session_id = auth.create_session(&pem).await.unwrap();

    auth.close_session(&session_id).unwrap();

    assert!(matches!(
        auth.can_device_perform(&request(&session_id, "mqtt:connect", "mqtt:clientId:x")),
        Err(Error::Authorization(_))
    ));
    assert!(matches!(auth.close_session(&session_id), Err(Error::Authorization(_))));
    h.service.shutdown().await;
}

#[tokio::test]
async fn refresh_closes_sessions_of_revoked_certificates() {
    // GIVEN: two live sessions
    let h = harness().await;
    let kept = device_certificate();
    let revoked = device_certificate();
    h.registry.register_certificate(&kept, "cert-kept");
    h.registry.register_certificate(&revoked, "cert-revoked");
    let auth = h.service.device_auth();
    let kept_id = auth.create_session(&kept).await.unwrap();
    let revoked_id = auth.create_session(&revoked).await.unwrap();

    // WHEN: one certificate is deactivated and the sweep runs
    h.registry.deactivate_certificate(&revoked);
    h.service.sessions().refresh_sessions().await;

    // THEN
    assert!(h.service.sessions().find_session(&kept_id).is_some());
    assert!(h.service.sessions().find_session(&revoked_id).is_none());
    h.service.shutdown().await;
}

#[tokio::test]
async fn cloud_outage_keeps_sessions_during_refresh() {
    let h = harness().await;
    let pem = device_certificate();
    h.registry.register_certificate(&pem, "cert-1");
    let session_id = h.service.device_auth().create_session(&pem).await.unwrap();

    h.registry.set_offline(true);
    h.service.sessions().refresh_sessions().await;

    assert!(h.service.sessions().find_session(&session_id).is_some());
    h.service.shutdown().await;
}
