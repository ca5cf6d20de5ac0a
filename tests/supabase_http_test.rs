use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use school_admin::supabase::{AuthApi, Backend, BackendError, Query, SupabaseClient};

async fn client(server: &MockServer) -> SupabaseClient {
    SupabaseClient::new(&server.uri(), "anon".into()).unwrap()
}

#[tokio::test]
async fn select_sends_filters_and_keys() {
    let server = MockServer::start().await;
    let school = Uuid::new_v4();
    Mock::given(method("GET"))
        .and(path("/rest/v1/users"))
        .and(query_param("school_id", format!("eq.{}", school)))
        .and(query_param("order", "full_name.asc"))
        .and(header("apikey", "anon"))
        .and(header("Authorization", "Bearer anon"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": Uuid::new_v4(), "full_name": "Moussa Fall"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let rows = client(&server)
        .await
        .select("users", &Query::new().eq("school_id", school).order("full_name", true))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["full_name"], "Moussa Fall");
}

#[tokio::test]
async fn duplicate_key_becomes_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/schools"))
        .and(header("Prefer", "return=representation"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "code": "23505",
            "message": "duplicate key value violates unique constraint \"schools_name_key\""
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .await
        .insert("schools", json!({"name": "Lycée Kennedy"}))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Conflict(_)));
}

#[tokio::test]
async fn function_error_body_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/functions/v1/create-staff-account"))
        .and(header("Authorization", "Bearer caller-jwt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": "A user with this email address has already been registered",
            "code": "email_exists"
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .await
        .invoke_function("create-staff-account", "caller-jwt", json!({"email": "a@b.sn"}))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::AlreadyRegistered));
}

#[tokio::test]
async fn password_sign_in_sets_bearer() {
    let server = MockServer::start().await;
    let user_id = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "password"))
        .and(body_json(json!({"email": "dir@ecole.sn", "password": "Dakar2024!x"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "expires_in": 3600,
            "user": {"id": user_id, "email": "dir@ecole.sn"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/verify_pin"))
        .and(header("Authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server).await;
    let session = client
        .sign_in_with_password("dir@ecole.sn", "Dakar2024!x")
        .await
        .unwrap();
    assert_eq!(session.user_id, user_id);
    assert_eq!(session.refresh_token, "rt-1");
    assert!(session.expires_at > chrono::Utc::now());

    client.set_access_token(Some(session.access_token));
    let value = client.rpc("verify_pin", json!({})).await.unwrap();
    assert!(value.is_null());
}

#[tokio::test]
async fn bad_credentials_and_unfiltered_writes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Invalid login credentials"
        })))
        .mount(&server)
        .await;

    let client = client(&server).await;
    let err = client.sign_in_with_password("x@y.sn", "nope").await.unwrap_err();
    assert!(matches!(err, BackendError::InvalidCredentials));

    let err = client
        .update("users", &Query::new(), json!({"is_active": false}))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Rejected(_)));
    let err = client.delete("users", &Query::new()).await.unwrap_err();
    assert!(matches!(err, BackendError::Rejected(_)));
}
