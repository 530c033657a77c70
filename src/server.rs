use std::sync::Arc;

use log::info;
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use uuid::Uuid;
use warp::ws::{WebSocket, Ws};
use warp::Filter;

use crate::config::Config;
use crate::hub::{Hub, HubHandle};
use crate::store::HistoryStore;
use crate::transport;
use crate::user::{Profile, User};

/// Query parameters of `/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub room: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone)]
pub struct Server {
    hub: HubHandle,
    store: Arc<dyn HistoryStore>,
    config: Arc<Config>,
}

impl Server {
    pub fn new(store: Arc<dyn HistoryStore>, config: Arc<Config>) -> Self {
        let hub = Hub::spawn(Arc::clone(&store), Arc::clone(&config));
        Server { hub, store, config }
    }

    pub fn handle_connection(&self, ws: WebSocket, params: ConnectParams) {
        let profile = Profile {
            id: Uuid::new_v4(),
            name: display_name(params.name),
        };
        info!("New connection: {} ({})", profile.name, profile.id);

        let (sink, stream) = transport::split(ws);
        User::spawn(
            sink,
            stream,
            profile,
            params.room.filter(|room| !room.is_empty()),
            self.hub.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.config),
        );
    }

    /// `/ws` upgrades to a chat connection, `/rooms` lists active rooms, anything else
    /// is served from the static directory.
    pub fn routes(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let server = self.clone();
        let max_message_size = self.config.max_message_size;
        let ws_route = warp::path("ws")
            .and(warp::path::end())
            .and(warp::ws())
            .and(warp::query::<ConnectParams>())
            .map(move |ws: Ws, params: ConnectParams| {
                let server = server.clone();
                ws.max_message_size(max_message_size)
                    .on_upgrade(move |socket| async move {
                        server.handle_connection(socket, params);
                    })
            });

        let hub = self.hub.clone();
        let rooms_route = warp::path("rooms")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let hub = hub.clone();
                async move {
                    match hub.rooms().await {
                        Ok(rooms) => Ok(warp::reply::json(&rooms)),
                        Err(_) => Err(warp::reject::not_found()),
                    }
                }
            });

        let static_files = warp::fs::dir(self.config.static_dir.clone());

        ws_route
            .or(rooms_route)
            .or(static_files)
            .with(warp::cors().allow_any_origin())
    }
}

fn display_name(requested: Option<String>) -> String {
    match requested.map(|name| name.trim().to_string()) {
        Some(name) if !name.is_empty() => name,
        _ => {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(4)
                .map(char::from)
                .collect();
            format!("guest-{suffix}")
        }
    }
}
