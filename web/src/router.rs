use crate::{
    controller::{connection_controller, health_check_controller, rpc},
    middleware::auth::require_peer,
    stream, AppState,
};
use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use sse::cluster::wire::{
    CONNECTION_QUERY_SERVICE, MESSAGE_REPOSITORY, REMOTE_CONNECTION_SERVICE, SEND_SERVICE,
};

pub fn define_routes(app_state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(push_routes(app_state.clone()))
        .merge(cluster_rpc_routes(app_state))
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

fn push_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/sse/connect", get(stream::handler::connect))
        .route("/sse/listeners/add", post(connection_controller::add_listeners))
        .route(
            "/sse/listeners/remove",
            post(connection_controller::remove_listeners),
        )
        .route("/sse/disconnect", post(connection_controller::disconnect))
        .with_state(app_state)
}

fn cluster_rpc_routes(app_state: AppState) -> Router {
    Router::new()
        .route(
            &format!("/{CONNECTION_QUERY_SERVICE}/:method"),
            get(rpc::connection_query_controller::query),
        )
        .route(
            &format!("/{SEND_SERVICE}/:method"),
            post(rpc::send_controller::send),
        )
        .route(
            &format!("/{REMOTE_CONNECTION_SERVICE}/:method"),
            post(rpc::remote_connection_controller::disconnect),
        )
        .route(
            &format!("/{MESSAGE_REPOSITORY}/:method"),
            post(rpc::message_repository_controller::call),
        )
        .route_layer(from_fn_with_state(app_state.clone(), require_peer))
        .with_state(app_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{app_state, ACCOUNT, PASSWORD};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
        response::Response,
    };
    use futures::StreamExt;
    use serde_json::{json, Value};
    use sse::access_user::AccessUser;
    use sse::cluster::remote::basic_authorization;
    use sse::connection::ConnectRequest;
    use sse::message::{Audience, Message};
    use sse::send::SendService;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn rpc(method: Method, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, basic_authorization(ACCOUNT, PASSWORD))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_check_responds_ok() {
        let app = define_routes(app_state());
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn push_stream_sends_connect_finish_and_disconnects_on_drop() {
        let state = app_state();
        let app = define_routes(state.clone());
        let request = Request::builder()
            .uri("/sse/connect?accessToken=t1&userId=u1&channel=web&listeners=price,news")
            .header(header::USER_AGENT, "test-agent")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(state.manager.registry().connection_count(), 1);

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        let frame = String::from_utf8(first.to_vec()).unwrap();
        assert!(frame.contains("event: connect-finish"), "{frame}");

        let connection = state.manager.registry().lookup_by_access_token("t1").remove(0);
        assert!(connection.is_writeable());
        assert_eq!(connection.channel(), Some("web"));
        assert!(connection.is_listening("price"));

        drop(body);
        assert_eq!(state.manager.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn connect_without_access_token_is_rejected() {
        let app = define_routes(app_state());
        let request = Request::builder()
            .uri("/sse/connect?userId=u1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn listeners_add_remove_and_unknown_connection() {
        let state = app_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = state
            .manager
            .connect(ConnectRequest::new(AccessUser::new("u1", "t1")), tx)
            .unwrap();
        let id = connection.id().value();

        let app = define_routes(state.clone());
        let response = app
            .clone()
            .oneshot(post_json(
                "/sse/listeners/add",
                json!({"connectionId": id, "listeners": ["price"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(connection.is_listening("price"));

        let response = app
            .clone()
            .oneshot(post_json(
                "/sse/listeners/remove",
                json!({"connectionId": id, "listeners": ["price"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!connection.is_listening("price"));

        let response = app
            .oneshot(post_json(
                "/sse/listeners/add",
                json!({"connectionId": 999, "listeners": ["price"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disconnect_endpoint_closes_connection() {
        let state = app_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = state
            .manager
            .connect(ConnectRequest::new(AccessUser::new("u1", "t1")), tx)
            .unwrap();

        let response = define_routes(state.clone())
            .oneshot(post_json(
                "/sse/disconnect",
                json!({"connectionId": connection.id().value()}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["data"], json!(1));
        assert!(connection.is_disconnected());
    }

    #[tokio::test]
    async fn cluster_rpc_requires_basic_auth() {
        let app = define_routes(app_state());
        let request = Request::builder()
            .uri("/ConnectionQueryService/connectionCount")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/ConnectionQueryService/connectionCount")
            .header(header::AUTHORIZATION, basic_authorization(ACCOUNT, "wrong"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn connection_queries_answer_in_envelope() {
        let state = app_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        state
            .manager
            .connect(ConnectRequest::new(AccessUser::new("u1", "t1")), tx)
            .unwrap();
        let app = define_routes(state);

        let response = app
            .clone()
            .oneshot(rpc(Method::GET, "/ConnectionQueryService/isOnline?userId=u1", Value::Null))
            .await
            .unwrap();
        assert_eq!(json_body(response).await, json!({"data": true}));

        let response = app
            .clone()
            .oneshot(rpc(Method::GET, "/ConnectionQueryService/getUser?userId=u1", Value::Null))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["type"], json!("access-user"));
        assert_eq!(body["data"]["id"], json!("u1"));

        let response = app
            .oneshot(rpc(Method::GET, "/ConnectionQueryService/bogus", Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn send_service_counts_or_collects_receivers() {
        let state = app_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = state
            .manager
            .connect(ConnectRequest::new(AccessUser::new("u1", "t1")), tx)
            .unwrap();
        connection.writeable_ready().unwrap();
        let app = define_routes(state);

        let response = app
            .clone()
            .oneshot(rpc(
                Method::POST,
                "/SendService/sendByUserId",
                json!({"eventName": "price", "body": 10, "userIds": ["u1"]}),
            ))
            .await
            .unwrap();
        assert_eq!(json_body(response).await, json!({"data": 1}));

        let response = app
            .clone()
            .oneshot(rpc(
                Method::POST,
                "/SendService/sendAll",
                json!({"eventName": "news", "collect": true}),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["data"][0]["accessToken"], json!("t1"));

        let response = app
            .oneshot(rpc(
                Method::POST,
                "/SendService/sendByChannel",
                json!({"eventName": "news"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.extend(event.name);
        }
        assert_eq!(names, vec!["connect-finish", "price", "news"]);
    }

    #[tokio::test]
    async fn remote_disconnect_by_user_id() {
        let state = app_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        state
            .manager
            .connect(ConnectRequest::new(AccessUser::new("u1", "t1")), tx)
            .unwrap();
        let app = define_routes(state.clone());

        let response = app
            .oneshot(rpc(
                Method::POST,
                "/RemoteConnectionService/disconnectByUserId",
                json!({"userId": "u1"}),
            ))
            .await
            .unwrap();
        assert_eq!(json_body(response).await, json!({"data": 1}));
        assert_eq!(state.manager.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn message_repository_select_and_delete() {
        let state = app_state();
        let message = Message::new("order", json!(1), Audience::access_tokens(vec!["t1".into()]));
        let id = state.repository.insert(message).unwrap();
        let app = define_routes(state.clone());

        let response = app
            .clone()
            .oneshot(rpc(
                Method::POST,
                "/MessageRepository/select",
                json!({"accessToken": "t1", "userId": "u1"}),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["data"][0]["id"], json!(id));

        let response = app
            .oneshot(rpc(Method::POST, "/MessageRepository/delete", json!({"id": id})))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["data"]["eventName"], json!("order"));
        assert!(state.repository.list().is_empty());
    }

    #[tokio::test]
    async fn stored_message_reaches_stream_opened_later() {
        let state = app_state();
        let pending = state
            .delivery
            .send_by_access_token(vec!["t9".into()], "order", json!({"n": 1}))
            .await;
        assert!(!pending.is_ready());

        let request = Request::builder()
            .uri("/sse/connect?accessToken=t9&userId=u9")
            .body(Body::empty())
            .unwrap();
        let response = define_routes(state.clone()).oneshot(request).await.unwrap();
        let mut body = response.into_body().into_data_stream();
        let mut frames = String::new();
        while !frames.contains("event: order") {
            let chunk = body.next().await.unwrap().unwrap();
            frames.push_str(&String::from_utf8(chunk.to_vec()).unwrap());
        }

        let receivers = pending.await;
        assert_eq!(receivers[0].access_token, "t9");
        assert!(state.repository.list().is_empty());
    }
}
