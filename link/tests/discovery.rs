//! Device discovery against a local HTTP server

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_test::{assert_err, assert_ok};

use bootlink::authn::Credentials;
use bootlink::errors::LinkError;
use bootlink::http::ApiClient;
use bootlink::models::{Capability, DeviceType};

const TOKEN: &str = "opaque-test-token";

#[derive(Clone, Default)]
struct Seen {
    projects: Arc<Mutex<Vec<Option<String>>>>,
}

async fn devices(
    State(seen): State<Seen>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", TOKEN))
        .unwrap_or(false);
    if !authorized {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let project = query.get("project").cloned();
    seen.projects.lock().unwrap().push(project.clone());

    Ok(Json(json!({
        "devices": [
            {"thingName": "catcam-01", "thingArn": "arn:aws:iot:thing/catcam-01", "project": project},
            {"thingName": "kappa-02", "deviceType": "kappa-warmer", "capabilities": ["heater", "settings", "teleport"]},
            {"thingName": "mystery-03", "deviceType": "toaster"}
        ],
        "count": 3
    })))
}

/// Serve `/devices` on an ephemeral port
async fn serve() -> (String, Seen) {
    let seen = Seen::default();
    let app = Router::new().route("/devices", get(devices)).with_state(seen.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), seen)
}

#[tokio::test]
async fn test_list_devices() {
    let (base_url, seen) = serve().await;
    let client = ApiClient::new(&base_url).unwrap();
    let credentials = Credentials::new(TOKEN).unwrap();

    let devices = assert_ok!(client.list_devices(&credentials, Some("catcam")).await);
    assert_eq!(devices.len(), 3);
    assert_eq!(seen.projects.lock().unwrap().as_slice(), [Some("catcam".to_string())]);

    let catcam = &devices[0];
    assert_eq!(catcam.id, "catcam-01");
    assert_eq!(catcam.device_type, DeviceType::Bootboots);
    assert_eq!(catcam.project, "catcam");
    assert!(catcam.has_capability(Capability::Photos));
    assert!(catcam.has_capability(Capability::Logs));
    assert!(!catcam.has_capability(Capability::Heater));

    let kappa = &devices[1];
    assert_eq!(kappa.device_type, DeviceType::KappaWarmer);
    assert!(kappa.has_capability(Capability::Heater));
    assert!(kappa.has_capability(Capability::Settings));
    assert_eq!(kappa.capabilities.len(), 2);

    let mystery = &devices[2];
    assert_eq!(mystery.device_type, DeviceType::Unknown);
    assert!(mystery.capabilities.is_empty());
}

#[tokio::test]
async fn test_unfiltered_listing() {
    let (base_url, seen) = serve().await;
    let client = ApiClient::new(&base_url).unwrap();
    let credentials = Credentials::new(TOKEN).unwrap();

    let devices = assert_ok!(client.list_devices(&credentials, None).await);
    assert_eq!(devices.len(), 3);
    assert_eq!(seen.projects.lock().unwrap().as_slice(), [None::<String>]);
    // No project is invented for records that carry none
    assert_eq!(devices[0].project, "");
    assert_eq!(devices[1].project, "");
}

#[tokio::test]
async fn test_rejected_token() {
    let (base_url, _) = serve().await;
    let client = ApiClient::new(&base_url).unwrap();
    let credentials = Credentials::new("someone-elses-token").unwrap();

    let err = assert_err!(client.list_devices(&credentials, Some("catcam")).await);
    assert!(matches!(err, LinkError::AuthError(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_unknown_route() {
    let (base_url, _) = serve().await;
    let client = ApiClient::new(&format!("{}/v2", base_url)).unwrap();
    let credentials = Credentials::new(TOKEN).unwrap();

    let err = assert_err!(client.list_devices(&credentials, None).await);
    assert!(matches!(err, LinkError::NotFound(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_expired_token_not_sent() {
    let (base_url, seen) = serve().await;
    let client = ApiClient::new(&base_url).unwrap();
    let claims = json!({"sub": "user-1", "exp": Utc::now().timestamp() - 60});
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"test")).unwrap();
    let credentials = Credentials::new(token).unwrap();

    let err = assert_err!(client.list_devices(&credentials, None).await);
    assert!(matches!(err, LinkError::AuthError(_)));
    assert!(seen.projects.lock().unwrap().is_empty());
}
