/// OpenAPI documentation for the Orbit Messaging Service
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Orbit Messaging Service API",
        version = "1.0.0",
        description = "Real-time messaging, presence and unread synchronization",
        contact(
            name = "Orbit Team",
            email = "support@orbit.app"
        ),
        license(
            name = "MIT"
        )
    ),
    servers(
        (url = "http://localhost:8086", description = "Development server"),
        (url = "https://api.orbit.app/messaging", description = "Production server"),
    ),
    tags(
        (name = "Health", description = "Service health checks"),
        (name = "Conversations", description = "Conversation management"),
        (name = "Messages", description = "Message send and history"),
        (name = "WebSocket", description = "Real-time events via WebSocket"),
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    pub fn title() -> &'static str {
        "Orbit Messaging Service"
    }

    pub fn openapi_json_path() -> &'static str {
        "/openapi.json"
    }
}
