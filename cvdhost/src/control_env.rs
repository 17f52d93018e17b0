//! Discovery of the gRPC services an instance exposes on UNIX sockets.
//!
//! Each service listens on a socket named after it inside one directory.
//! Services and methods are resolved through gRPC server reflection and
//! reported as JSON strings, so callers need no generated stubs.

use std::collections::HashMap;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use prost::Message;
use prost_types::FileDescriptorProto;
use serde::Serialize;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::{ServerReflectionRequest, ServerReflectionResponse};
use tower::service_fn;

use cvdhost_shared::errors::{CvdResult, ErrorKind, StackTraceError};
use cvdhost_shared::{ensure, propagate, stack_err};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodDescription {
    pub name: String,
    pub input_type: String,
    pub output_type: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDescription {
    pub name: String,
    pub methods: Vec<MethodDescription>,
}

pub struct ControlEnvProxy {
    socket_dir: PathBuf,
    runtime: tokio::runtime::Runtime,
    channels: Mutex<HashMap<String, Channel>>,
}

impl ControlEnvProxy {
    pub fn new(socket_dir: impl Into<PathBuf>) -> CvdResult<Self> {
        let runtime = propagate!(
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build(),
            "building control-env runtime"
        );
        Ok(Self {
            socket_dir: socket_dir.into(),
            runtime,
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Socket file names in the directory, sorted.
    pub fn server_names(&self) -> CvdResult<Vec<String>> {
        let entries = propagate!(
            std::fs::read_dir(&self.socket_dir),
            "listing {}",
            self.socket_dir.display()
        );
        let mut names = Vec::new();
        for entry in entries {
            let entry = propagate!(entry);
            let file_type = propagate!(entry.file_type());
            if file_type.is_socket() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Cached channel to `server`. Connection happens on first use.
    fn channel(&self, server: &str) -> CvdResult<Channel> {
        if let Some(channel) = self.channels.lock().get(server) {
            return Ok(channel.clone());
        }
        let path = self.socket_dir.join(server);
        ensure!(
            path.exists(),
            kind = ErrorKind::Config,
            "no socket for server {} in {}",
            server,
            self.socket_dir.display()
        );
        let channel = {
            let _enter = self.runtime.enter();
            uds_channel(path)?
        };
        self.channels
            .lock()
            .insert(server.to_string(), channel.clone());
        Ok(channel)
    }

    /// Forget a cached channel, e.g. after its server restarted.
    pub fn invalidate(&self, server: &str) {
        self.channels.lock().remove(server);
    }

    /// Fully qualified service names registered on `server`.
    pub fn list_services(&self, server: &str) -> CvdResult<Vec<String>> {
        let response = propagate!(self.reflect(server, MessageRequest::ListServices(String::new())));
        match response {
            MessageResponse::ListServicesResponse(list) => {
                let mut names: Vec<String> = list.service.into_iter().map(|s| s.name).collect();
                names.sort();
                Ok(names)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Methods of `service` (e.g. `gnss.GnssGrpcProxy`) on `server`.
    pub fn describe_service(&self, server: &str, service: &str) -> CvdResult<ServiceDescription> {
        let response = propagate!(
            self.reflect(server, MessageRequest::FileContainingSymbol(service.to_string())),
            "resolving {}",
            service
        );
        let MessageResponse::FileDescriptorResponse(files) = response else {
            return Err(unexpected(response));
        };
        for encoded in &files.file_descriptor_proto {
            let file = propagate!(
                FileDescriptorProto::decode(encoded.as_slice()).map_err(StackTraceError::protocol),
                "decoding descriptor for {}",
                service
            );
            if let Some(found) = find_service(&file, service) {
                return Ok(found);
            }
        }
        Err(stack_err!(
            kind = ErrorKind::ResourceUnavailable,
            "service {} not found on {}",
            service,
            server
        ))
    }

    /// One method of a service.
    pub fn describe_method(
        &self,
        server: &str,
        service: &str,
        method: &str,
    ) -> CvdResult<MethodDescription> {
        let description = propagate!(self.describe_service(server, service));
        Ok(propagate!(
            description.methods.into_iter().find(|m| m.name == method),
            "method {} not found in {}",
            method,
            service
        ))
    }

    /// `{"services": [...]}` for `server`.
    pub fn list_services_json(&self, server: &str) -> CvdResult<String> {
        let services = propagate!(self.list_services(server));
        Ok(propagate!(serde_json::to_string(&serde_json::json!({ "services": services }))))
    }

    pub fn describe_service_json(&self, server: &str, service: &str) -> CvdResult<String> {
        let description = propagate!(self.describe_service(server, service));
        Ok(propagate!(serde_json::to_string(&description)))
    }

    pub fn describe_method_json(&self, server: &str, service: &str, method: &str) -> CvdResult<String> {
        let description = propagate!(self.describe_method(server, service, method));
        Ok(propagate!(serde_json::to_string(&description)))
    }

    fn reflect(&self, server: &str, request: MessageRequest) -> CvdResult<MessageResponse> {
        let channel = propagate!(self.channel(server));
        let result = self.runtime.block_on(reflection_call(channel, request));
        if result.is_err() {
            // The server may have been restarted on a new socket inode.
            self.invalidate(server);
        }
        let response = propagate!(result, "reflection request to {}", server);
        match response.message_response {
            Some(MessageResponse::ErrorResponse(err)) => Err(stack_err!(
                kind = ErrorKind::Protocol,
                "reflection error {}: {}",
                err.error_code,
                err.error_message
            )),
            Some(message) => Ok(message),
            None => Err(stack_err!(kind = ErrorKind::Protocol, "empty reflection response")),
        }
    }
}

fn uds_channel(path: PathBuf) -> CvdResult<Channel> {
    // The URI is ignored; every connection goes to `path`.
    let endpoint = propagate!(
        Endpoint::try_from("http://[::]:50051").map_err(StackTraceError::protocol)
    );
    Ok(endpoint.connect_with_connector_lazy(service_fn(move |_: Uri| {
        let path = path.clone();
        async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
    })))
}

async fn reflection_call(
    channel: Channel,
    request: MessageRequest,
) -> CvdResult<ServerReflectionResponse> {
    let mut client = ServerReflectionClient::new(channel);
    let request = ServerReflectionRequest {
        host: String::new(),
        message_request: Some(request),
    };
    let mut stream = client
        .server_reflection_info(tokio_stream::iter(vec![request]))
        .await
        .map_err(StackTraceError::protocol)?
        .into_inner();
    let response = stream.message().await.map_err(StackTraceError::protocol)?;
    response.ok_or_else(|| StackTraceError::protocol("reflection stream closed without a response"))
}

fn unexpected(response: MessageResponse) -> StackTraceError {
    stack_err!(kind = ErrorKind::Protocol, "unexpected reflection response: {:?}", response)
}

fn find_service(file: &FileDescriptorProto, full_name: &str) -> Option<ServiceDescription> {
    let package = file.package();
    file.service.iter().find_map(|service| {
        let name = if package.is_empty() {
            service.name().to_string()
        } else {
            format!("{}.{}", package, service.name())
        };
        (name == full_name).then(|| ServiceDescription {
            name,
            methods: service
                .method
                .iter()
                .map(|method| MethodDescription {
                    name: method.name().to_string(),
                    input_type: method.input_type().trim_start_matches('.').to_string(),
                    output_type: method.output_type().trim_start_matches('.').to_string(),
                    client_streaming: method.client_streaming(),
                    server_streaming: method.server_streaming(),
                })
                .collect(),
        })
    })
}

/// Whether `path` looks like a socket this proxy can dial.
pub fn is_service_socket(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false)
}
