use std::fmt::Write as _;

use log::info;
use serde::Serialize;

use crate::{
    dispatcher::{Dispatcher, EchoHandler},
    form::form_value,
    http::{Method, Request, Response},
    ota::{OtaError, OtaRequest, OtaStatus},
    relay::RelayController,
    types::RelayState,
};

pub const CONTENT_TYPE_HTML: &str = "text/html";
pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug)]
pub struct DeviceState {
    pub relay: RelayController,
    pub pending_ota: Option<OtaRequest>,
    pub ota_status: OtaStatus,
}

impl DeviceState {
    pub fn new(relay: RelayController, ota_supported: bool) -> Self {
        Self {
            relay,
            pending_ota: None,
            ota_status: OtaStatus::new(ota_supported),
        }
    }
}

#[derive(Serialize)]
struct StateView<'a> {
    relay: RelayState,
    ota: &'a OtaStatus,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct AcceptedBody {
    accepted: bool,
    #[serde(rename = "inProgress")]
    in_progress: bool,
}

pub fn control_page(state: RelayState) -> String {
    format!(
        "<!DOCTYPE HTML>\n<html>\nDO0={}<br><br>\n\
         <a href=\"/DO0=1\"><button>Turn On </button></a>\n\
         <a href=\"/DO0=0\"><button>Turn Off </button></a><br />\n\
         </html>\n",
        state.as_digit()
    )
}

pub fn register_routes(dispatcher: &mut Dispatcher<DeviceState>, diagnostic_echo: bool) {
    dispatcher.register_handler("/", handle_index);
    dispatcher.register_handler("/DO0=1", handle_switch_on);
    dispatcher.register_handler("/DO0=0", handle_switch_off);
    dispatcher.register_handler("/api/state", handle_state);
    dispatcher.register_handler("/ota", handle_ota);

    if diagnostic_echo {
        dispatcher.set_fallback(EchoHandler);
    }
}

fn render_page(state: &DeviceState, response: &mut Response) {
    response.set_status(200);
    response.set_content_type(CONTENT_TYPE_HTML);
    let _ = response.write_str(&control_page(state.relay.current_state()));
}

fn handle_index(state: &mut DeviceState, _request: &Request, response: &mut Response) {
    render_page(state, response);
}

fn handle_switch_on(state: &mut DeviceState, _request: &Request, response: &mut Response) {
    state.relay.turn_on();
    info!("relay switched ON over http");
    render_page(state, response);
}

fn handle_switch_off(state: &mut DeviceState, _request: &Request, response: &mut Response) {
    state.relay.turn_off();
    info!("relay switched OFF over http");
    render_page(state, response);
}

fn handle_state(state: &mut DeviceState, _request: &Request, response: &mut Response) {
    let view = StateView {
        relay: state.relay.current_state(),
        ota: &state.ota_status,
    };
    write_json(response, 200, &view);
}

fn handle_ota(state: &mut DeviceState, request: &Request, response: &mut Response) {
    if request.method() != &Method::Post {
        write_error(response, 405, "use POST with url and sha256 form fields");
        return;
    }
    if !state.ota_status.supported {
        write_error(response, 501, "OTA is not available on this build");
        return;
    }

    let body = request.body_text();
    let update = OtaRequest::new(
        form_value(&body, "url").unwrap_or_default(),
        form_value(&body, "sha256"),
    );
    if let Err(err) = update.validate() {
        write_error(response, 400, &err.to_string());
        return;
    }
    if state.pending_ota.is_some() || state.ota_status.in_progress {
        write_error(response, 409, &OtaError::AlreadyInProgress.to_string());
        return;
    }

    info!("queued OTA update from {}", update.url);
    state.pending_ota = Some(update);
    write_json(
        response,
        202,
        &AcceptedBody {
            accepted: true,
            in_progress: true,
        },
    );
}

fn write_json<T: Serialize>(response: &mut Response, status: u16, payload: &T) {
    match serde_json::to_vec(payload) {
        Ok(bytes) => {
            response.set_status(status);
            response.set_content_type(CONTENT_TYPE_JSON);
            response.write_bytes(&bytes);
        }
        Err(err) => {
            response.set_status(500);
            let _ = write!(response, "failed to encode response: {err}");
        }
    }
}

fn write_error(response: &mut Response, status: u16, message: &str) {
    write_json(
        response,
        status,
        &ErrorBody {
            error: message.to_string(),
        },
    );
}
