//! Main application run loop

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use colored::Colorize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::options::{AppOptions, TransportKind};
use crate::authn::Credentials;
use crate::ble::BluetoothTransport;
use crate::cache::{ImageCache, ImageGallery};
use crate::errors::LinkError;
use crate::filesys::file::File;
use crate::http::ApiClient;
use crate::models::{DeviceResponse, ImagePayload};
use crate::transport::{response_handler, state_handler, ConnectionState, DeviceTransport};
use crate::ws::WebSocketTransport;

/// Environment variable holding the id token
pub const TOKEN_ENV: &str = "BOOTLINK_TOKEN";

/// Run the client
pub async fn run(options: AppOptions, shutdown_signal: impl Future<Output = ()> + Send + 'static) -> Result<(), LinkError> {
    if options.list_devices {
        return list_devices(&options).await;
    }

    let transport = init_transport(&options)?;
    info!("Using {} transport for {}", transport.transport_type(), options.device.name);

    let gallery = ImageGallery::new(Arc::new(ImageCache::new(options.settings.cache_capacity)));
    gallery.attach(transport.clone());

    // Handlers run synchronously; images are written from the main loop
    let (image_tx, mut image_rx) = mpsc::unbounded_channel::<ImagePayload>();
    let response_id = transport.on_response(response_handler(move |response| {
        print_response(response);
        if let DeviceResponse::Image(image) = response {
            if let Err(e) = image_tx.send(image.clone()) {
                debug!("Not saving {}: {}", image.filename, e);
            }
        }
    }));
    let state_id = transport.on_connection_state_change(state_handler(|state| print_state(*state)));

    let result = drive(&options, transport.as_ref(), &mut image_rx, shutdown_signal).await;

    transport.off_response(response_id);
    transport.off_connection_state_change(state_id);
    gallery.detach();
    transport.disconnect();
    info!("{} image(s) cached", gallery.cache().len());

    result
}

async fn drive(
    options: &AppOptions,
    transport: &dyn DeviceTransport,
    images: &mut mpsc::UnboundedReceiver<ImagePayload>,
    shutdown_signal: impl Future<Output = ()> + Send,
) -> Result<(), LinkError> {
    transport.connect(&options.device).await?;

    if options.query_status {
        match transport.query_status().await {
            Ok(status) => println!("{}", serde_json::to_string_pretty(&status)?),
            Err(e) if e.is_timeout() => warn!("Device did not answer the status query"),
            Err(e) => return Err(e),
        }
    }

    for command in &options.commands {
        info!("Sending {}", command.command.as_str());
        transport.send_command(command).await?;
    }

    let watch = tokio::time::sleep(options.watch);
    tokio::pin!(watch);
    tokio::pin!(shutdown_signal);
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received, disconnecting...");
                return Ok(());
            }
            _ = &mut watch => {
                return Ok(());
            }
            Some(image) = images.recv() => {
                if let Some(dir) = &options.save_dir {
                    if let Err(e) = save_image(dir, &image).await {
                        error!("Failed to save {}: {}", image.filename, e);
                    }
                }
            }
        }
    }
}

fn init_transport(options: &AppOptions) -> Result<Arc<dyn DeviceTransport>, LinkError> {
    let settings = &options.settings;
    let transport: Arc<dyn DeviceTransport> = match options.transport {
        TransportKind::Bluetooth => Arc::new(BluetoothTransport::with_btleplug(
            settings.bluetooth.adapter_options(),
            settings.bluetooth.bluetooth_options(),
        )),
        TransportKind::Relay => {
            let credentials = Credentials::from_env(TOKEN_ENV)?;
            credentials.ensure_valid()?;
            Arc::new(WebSocketTransport::relay(
                &settings.relay.url,
                Some(credentials),
                settings.relay.websocket_options(),
            )?)
        }
    };
    Ok(transport)
}

async fn list_devices(options: &AppOptions) -> Result<(), LinkError> {
    let credentials = Credentials::from_env(TOKEN_ENV)?;
    let client = ApiClient::new(&options.settings.api.base_url)?;
    // An empty --project lists every project
    let project = Some(options.project.as_str()).filter(|p| !p.is_empty());
    let devices = client.list_devices(&credentials, project).await?;

    for device in &devices {
        let capabilities: Vec<String> = device
            .capabilities
            .iter()
            .map(|c| format!("{:?}", c).to_lowercase())
            .collect();
        eprintln!(
            "{} {} [{}] {}",
            "●".cyan(),
            device.name.bold(),
            device.device_type,
            capabilities.join(", ").dimmed()
        );
    }
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

async fn save_image(dir: &Path, image: &ImagePayload) -> Result<(), LinkError> {
    let name = Path::new(&image.filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "image.jpg".to_string());
    let file = File::new(dir.join(name));
    file.write_bytes(&image.decode()?).await?;
    info!("Saved {}", file.path().display());
    Ok(())
}

/// Responses as printed, with image bodies summarised
fn printable(response: &DeviceResponse) -> Value {
    match response {
        DeviceResponse::Image(image) => json!({
            "type": "image",
            "filename": image.filename,
            "size": image.size,
            "base64_len": image.base64().len(),
        }),
        other => serde_json::to_value(other).unwrap_or(Value::Null),
    }
}

fn print_response(response: &DeviceResponse) {
    let line = printable(response).to_string();
    if response.is_error() {
        println!("{}", line.red());
    } else {
        println!("{}", line);
    }
}

fn print_state(state: ConnectionState) {
    let label = match state {
        ConnectionState::Connected => "connected".green(),
        ConnectionState::Connecting => "connecting".yellow(),
        ConnectionState::Reconnecting => "reconnecting".yellow(),
        ConnectionState::Disconnected => "disconnected".red(),
    };
    eprintln!("{} {}", "●".bold(), label);
}
