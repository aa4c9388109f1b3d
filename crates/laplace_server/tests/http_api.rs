//! HTTP listener behavior exercised through the request handler.

mod common;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Method, Request, StatusCode};
use laplace_domain::SuccessfulData;
use laplace_server::listener::http::handle_request;

use common::harness;

fn request(method: Method, path: &str, body: &[u8]) -> Request<Full<Bytes>> {
	Request::builder()
		.method(method)
		.uri(path)
		.body(Full::new(Bytes::from(body.to_vec())))
		.unwrap()
}

async fn body_bytes(response: hyper::Response<Full<Bytes>>) -> Vec<u8> {
	response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

#[tokio::test]
async fn unknown_paths_are_404() {
	let h = harness(b"{}").await;

	let response = handle_request(h.services.clone(), request(Method::GET, "/nope/", b""), false).await;
	assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn state_changing_commands_require_post() {
	let h = harness(b"{}").await;

	let response = handle_request(h.services.clone(), request(Method::GET, "/register/", b""), true).await;
	assert_eq!(response.status(), StatusCode::OK);

	let data: SuccessfulData = serde_json::from_slice(&body_bytes(response).await).unwrap();
	assert!(!data.successful);
	assert_eq!(data.err, "Post Required!");
}

#[tokio::test]
async fn empty_works_with_any_method() {
	let h = harness(b"{}").await;

	let response = handle_request(h.services.clone(), request(Method::GET, "/empty/", b""), false).await;
	assert_eq!(response.status(), StatusCode::OK);

	let data: SuccessfulData = serde_json::from_slice(&body_bytes(response).await).unwrap();
	assert!(data.successful);
}

#[tokio::test]
async fn register_over_tls_succeeds_and_cleartext_is_refused() {
	let h = harness(b"{}").await;
	let body = br#"{"Username":"DerpityUnityTesty","Password":"YoYoZ0Z0@1"}"#;

	let refused = handle_request(h.services.clone(), request(Method::POST, "/register/", body), false).await;
	let value: serde_json::Value = serde_json::from_slice(&body_bytes(refused).await).unwrap();
	assert_eq!(value["error"], "Unsecure Connection!");

	let accepted = handle_request(h.services.clone(), request(Method::POST, "/register/", body), true).await;
	assert_eq!(body_bytes(accepted).await, b"DerpityUnityTesty");
}

#[tokio::test]
async fn get_user_resolves_registered_accounts() {
	let h = harness(b"{}").await;

	h.services.auth.create_account("friend", "YoYoZ0Z0@1").await.unwrap();
	let id = h.services.auth.auth_id_for("friend").await.unwrap().unwrap();

	let response = handle_request(
		h.services.clone(),
		request(Method::POST, "/user/", br#"{"Username":"friend"}"#),
		false,
	)
	.await;

	let value: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
	assert_eq!(value["AuthID"], id);
	assert_eq!(value["Username"], "friend");

	let missing = handle_request(
		h.services.clone(),
		request(Method::POST, "/user/", br#"{"Username":"stranger"}"#),
		false,
	)
	.await;

	let data: SuccessfulData = serde_json::from_slice(&body_bytes(missing).await).unwrap();
	assert_eq!(data.err, "User Does Not Exist!");
}

#[tokio::test]
async fn error_path_is_a_server_error() {
	let h = harness(b"{}").await;

	let response = handle_request(h.services.clone(), request(Method::GET, "/error/", b""), false).await;
	assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
	assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn unauthenticated_join_is_refused() {
	let h = harness(b"{}").await;

	let body = br#"{"GameID":"aaaaaaaaaaaab"}"#;
	let response = handle_request(h.services.clone(), request(Method::POST, "/game/join/", body), false).await;

	let value: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
	assert_eq!(value["Err"], "Unauthorized!");
}
