//! Chat room extension.
//!
//! A multi-client WebSocket chat with a shared nickname pool, rate-limited
//! tells, and a periodic math quiz scored by the first correct answer.  The
//! host loads this as a dynamic library through the `LoadPlugin`
//! entrypoint; everything the plugin touches goes through the server
//! handle it is given.

pub mod messages;
pub mod room;


use std::sync::Arc;

use serde_json::Value;
use url::Url;

use server_core::diagnostics::levels;
use server_core::{DiagnosticDelegate, DynServer, ResourceHandler, UnloadDelegate};

use crate::room::{Room, RoomConfig};

/// Build the chat room from its configuration subtree and wire it into the
/// server.  Returns `None` when the configuration is unusable, which the
/// host treats as a failed load.
pub fn load(
    server: &DynServer,
    configuration: &Value,
    diagnostics: &DiagnosticDelegate,
) -> Option<UnloadDelegate> {
    let Some(space) = configuration.get("space").and_then(Value::as_str) else {
        diagnostics("", levels::ERROR, "no 'space' URI in configuration");
        return None;
    };
    let segments = match parse_space(space) {
        Some(segments) => segments,
        None => {
            diagnostics(
                "",
                levels::ERROR,
                "unable to parse 'space' URI in configuration",
            );
            return None;
        }
    };

    let config = bind_room_config(configuration);
    let room = Room::new(config, server.time_keeper(), Arc::clone(diagnostics));
    room.start();

    let handler_room = Arc::clone(&room);
    let handler: ResourceHandler = Arc::new(move |request, connection, trailer| {
        let room = Arc::clone(&handler_room);
        Box::pin(async move { room.add_user(request, connection, trailer).await })
    });
    let registration = server.register_resource(&segments, handler);

    Some(Box::new(move || {
        registration.unregister();
        room.stop();
        room.reset();
    }))
}

/// The path of the `space` URI names the router subspace.  A bare path is
/// accepted as well as a full URI.
fn parse_space(space: &str) -> Option<Vec<String>> {
    match Url::parse(space) {
        Ok(url) => Some(
            url.path_segments()
                .map(|segments| {
                    segments
                        .filter(|segment| !segment.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        ),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Some(server_core::http::path_segments(space))
        }
        Err(_) => None,
    }
}

fn bind_room_config(configuration: &Value) -> RoomConfig {
    let mut config = RoomConfig::default();
    if let Some(nicknames) = configuration.get("nicknames").and_then(Value::as_array) {
        config.nicknames = nicknames
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
    if let Some(points) = configuration.get("initialPoints").and_then(Value::as_object) {
        config.initial_points = points
            .iter()
            .filter_map(|(nickname, value)| value.as_i64().map(|p| (nickname.clone(), p)))
            .collect();
    }
    if let Some(timeout) = configuration.get("tellTimeout").and_then(Value::as_f64) {
        config.tell_timeout = timeout;
    }
    if let Some(quiz) = configuration.get("mathQuiz").and_then(Value::as_object) {
        if let Some(min) = quiz.get("minCoolDown").and_then(Value::as_f64) {
            config.min_cooldown = min;
        }
        if let Some(max) = quiz.get("maxCoolDown").and_then(Value::as_f64) {
            config.max_cooldown = max;
        }
    }
    if config.min_cooldown > config.max_cooldown {
        std::mem::swap(&mut config.min_cooldown, &mut config.max_cooldown);
    }
    config
}

/// The entrypoint the host resolves after linking the runtime copy.
///
/// # Safety
/// Called by the host with references that outlive the call; the returned
/// delegate must be invoked before the library is unlinked.
#[no_mangle]
#[allow(non_snake_case, improper_ctypes_definitions)]
pub unsafe extern "C" fn LoadPlugin(
    server: &DynServer,
    configuration: &Value,
    diagnostics: &DiagnosticDelegate,
) -> Option<UnloadDelegate> {
    load(server, configuration, diagnostics)
}
