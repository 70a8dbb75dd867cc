use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::app_state::AppState;
use crate::broadcast_hub::ClientFrame;
use crate::models::{AvatarSlot, ProviderTag, UsageCounter};

/// A handle that controls the lifecycle of both the REST and WebSocket servers.
/// When this struct is dropped, both shut down and their background threads exit.
pub struct ApiServerHandle {
    rest_handle: ServerHandle,
    ws_handle: ServerHandle,
}

impl Drop for ApiServerHandle {
    fn drop(&mut self) {
        log::info!("stopping REST and WebSocket servers...");
        let rest_handle = self.rest_handle.clone();
        let ws_handle = self.ws_handle.clone();
        thread::spawn(move || {
            let sys = actix_web::rt::System::new();
            sys.block_on(async {
                rest_handle.stop(true).await;
                ws_handle.stop(true).await;
                log::info!("REST and WebSocket servers shut down complete.");
            });
        });
    }
}

// --- Data Models ---

#[derive(Serialize, Clone, ToSchema)]
pub struct StatusResponse {
    active_job_count: i64,
    parallel_queue_len: usize,
    slot_queue_len: usize,
    occupied_slot_count: usize,
    generation_id: u64,
}

#[derive(Serialize, Clone, ToSchema)]
pub struct VoiceResponse {
    id: String,
    display_name: String,
    provider: ProviderTag,
    avatar_refs: Vec<String>,
}

#[derive(Serialize, Clone, ToSchema)]
pub struct VoicesResponse {
    voices: Vec<VoiceResponse>,
    usage: Vec<UsageCounter>,
}

#[derive(Serialize, Clone, ToSchema)]
pub struct SlotsResponse {
    slots: Vec<AvatarSlot>,
    occupied_count: usize,
    generation_id: u64,
}

#[derive(Deserialize, ToSchema)]
pub struct TestVoiceRequest {
    voice_id: String,
    text: String,
}

#[derive(Serialize, ToSchema)]
pub struct TestVoiceResponse {
    audio_url: String,
}

// --- Shared State ---

struct ApiData {
    app_state: Arc<AppState>,
}

// --- OpenAPI Documentation ---

#[derive(OpenApi)]
#[openapi(
    paths(get_status, get_voices, get_slots, test_voice),
    components(schemas(
        StatusResponse,
        VoiceResponse,
        VoicesResponse,
        SlotsResponse,
        TestVoiceRequest,
        TestVoiceResponse,
        AvatarSlot,
        UsageCounter,
        ProviderTag
    )),
    tags(
        (name = "Dispatch Core", description = "Introspection endpoints for the chat-to-speech dispatch pipeline")
    )
)]
struct ApiDoc;

// --- Handlers ---

/// Returns active job count, queue depths, occupied slot count, current generation id.
#[utoipa::path(
    get, path = "/api/status", tag = "Dispatch Core",
    responses((status = 200, body = StatusResponse))
)]
async fn get_status(data: web::Data<ApiData>) -> impl Responder {
    let orchestrator = &data.app_state.orchestrator;
    let queue = orchestrator.queue_snapshot();
    HttpResponse::Ok().json(StatusResponse {
        active_job_count: orchestrator.active_job_count(),
        parallel_queue_len: queue.parallel_queue_len,
        slot_queue_len: queue.slot_queue_len,
        occupied_slot_count: orchestrator.occupied_slot_count(),
        generation_id: orchestrator.generation_id(),
    })
}

/// Lists currently enabled voices and per-voice usage stats.
#[utoipa::path(
    get, path = "/api/voices", tag = "Dispatch Core",
    responses((status = 200, body = VoicesResponse))
)]
async fn get_voices(data: web::Data<ApiData>) -> impl Responder {
    let registry = data.app_state.orchestrator.voices();
    let voices: Vec<VoiceResponse> = registry
        .enabled_voices()
        .into_iter()
        .map(|v| VoiceResponse {
            id: v.id,
            display_name: v.display_name,
            provider: v.provider_tag,
            avatar_refs: v.avatar_refs,
        })
        .collect();
    let usage = registry.usage_snapshot().to_counters();
    HttpResponse::Ok().json(VoicesResponse { voices, usage })
}

/// Lists the current avatar slot table with occupancy.
#[utoipa::path(
    get, path = "/api/slots", tag = "Dispatch Core",
    responses((status = 200, body = SlotsResponse))
)]
async fn get_slots(data: web::Data<ApiData>) -> impl Responder {
    let orchestrator = &data.app_state.orchestrator;
    HttpResponse::Ok().json(SlotsResponse {
        slots: orchestrator.slots_snapshot(),
        occupied_count: orchestrator.occupied_slot_count(),
        generation_id: orchestrator.generation_id(),
    })
}

/// Synthesizes a short test phrase on a given voice id without going through chat
/// ingress, for operator smoke-testing.
#[utoipa::path(
    post, path = "/api/test-voice", tag = "Dispatch Core",
    request_body = TestVoiceRequest,
    responses(
        (status = 200, body = TestVoiceResponse),
        (status = 400, description = "unknown or disabled voice id")
    )
)]
async fn test_voice(body: web::Json<TestVoiceRequest>, data: web::Data<ApiData>) -> impl Responder {
    match data.app_state.orchestrator.synth_test_phrase(&body.voice_id, &body.text).await {
        Ok(path) => HttpResponse::Ok().json(TestVoiceResponse {
            audio_url: path.display().to_string(),
        }),
        Err(e) => HttpResponse::BadRequest().body(e.to_string()),
    }
}

/// Upgrades the connection to a WebSocket and registers the overlay client with
/// the broadcast hub. The read loop only acts on `audio_ended` frames; anything
/// else (including parse failures) is ignored.
async fn ws_connect(req: HttpRequest, stream: web::Payload, data: web::Data<ApiData>) -> Result<HttpResponse, actix_web::Error> {
    let (response, session, mut msg_stream) = actix_ws::handle(&req, stream)?;
    let app_state = Arc::clone(&data.app_state);
    app_state.broadcast.connect(session);

    actix_web::rt::spawn(async move {
        while let Some(Ok(msg)) = msg_stream.next().await {
            if let actix_ws::Message::Text(text) = msg {
                if let Ok(ClientFrame::AudioEnded { slot_id }) = serde_json::from_str::<ClientFrame>(&text) {
                    app_state.orchestrator.release_slot_by_id(slot_id).await;
                }
            }
        }
    });

    Ok(response)
}

// --- Server Launcher ---

pub fn start_servers(app_state: Arc<AppState>, rest_port: u16, ws_port: u16) -> ApiServerHandle {
    let (rest_tx, rest_rx) = mpsc::channel();
    let (ws_tx, ws_rx) = mpsc::channel();

    spawn_rest_server(Arc::clone(&app_state), rest_port, rest_tx);
    spawn_ws_server(app_state, ws_port, ws_tx);

    let rest_handle = rest_rx.recv().expect("failed to start REST server or receive handle");
    let ws_handle = ws_rx.recv().expect("failed to start WebSocket server or receive handle");

    ApiServerHandle { rest_handle, ws_handle }
}

fn spawn_rest_server(app_state: Arc<AppState>, port: u16, tx: Sender<ServerHandle>) {
    thread::spawn(move || {
        let sys = actix_web::rt::System::new();
        let server_data = web::Data::new(ApiData { app_state });
        let openapi = ApiDoc::openapi();

        let server = HttpServer::new(move || {
            App::new()
                .app_data(server_data.clone())
                .service(SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi.clone()))
                .route("/api/status", web::get().to(get_status))
                .route("/api/voices", web::get().to(get_voices))
                .route("/api/slots", web::get().to(get_slots))
                .route("/api/test-voice", web::post().to(test_voice))
        })
        .bind(("0.0.0.0", port));

        match server {
            Ok(bound) => {
                log::info!("REST API listening on http://0.0.0.0:{}", port);
                log::info!("Swagger UI available at http://0.0.0.0:{}/swagger-ui/", port);
                let server = bound.run();
                let _ = tx.send(server.handle());
                if let Err(e) = sys.block_on(server) {
                    log::error!("REST server error: {}", e);
                }
            }
            Err(e) => log::error!("failed to bind REST server to port {}: {}", port, e),
        }
    });
}

fn spawn_ws_server(app_state: Arc<AppState>, port: u16, tx: Sender<ServerHandle>) {
    thread::spawn(move || {
        let sys = actix_web::rt::System::new();
        let server_data = web::Data::new(ApiData { app_state });

        let server = HttpServer::new(move || {
            App::new()
                .app_data(server_data.clone())
                .route("/ws", web::get().to(ws_connect))
        })
        .bind(("0.0.0.0", port));

        match server {
            Ok(bound) => {
                log::info!("overlay WebSocket listening on ws://0.0.0.0:{}/ws", port);
                let server = bound.run();
                let _ = tx.send(server.handle());
                if let Err(e) = sys.block_on(server) {
                    log::error!("WebSocket server error: {}", e);
                }
            }
            Err(e) => log::error!("failed to bind WebSocket server to port {}: {}", port, e),
        }
    });
}
