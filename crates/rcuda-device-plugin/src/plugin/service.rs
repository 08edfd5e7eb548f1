use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use device_plugin_pb::api::device_plugin_server::DevicePlugin;
use device_plugin_pb::api::AllocateRequest;
use device_plugin_pb::api::AllocateResponse;
use device_plugin_pb::api::ContainerAllocateRequest;
use device_plugin_pb::api::ContainerAllocateResponse;
use device_plugin_pb::api::DevicePluginOptions;
use device_plugin_pb::api::Empty;
use device_plugin_pb::api::ListAndWatchResponse;
use device_plugin_pb::api::PreStartContainerRequest;
use device_plugin_pb::api::PreStartContainerResponse;
use device_plugin_pb::api::PreferredAllocationRequest;
use device_plugin_pb::api::PreferredAllocationResponse;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::device_exists;
use crate::device::DeviceSet;
use crate::plugin::DeviceState;

/// Number of devices handed to the container.
pub const DEVICE_COUNT_ENV: &str = "RCUDA_DEVICE_COUNT";

/// Prefix of the per-device variables, `RCUDA_DEVICE_0`, `RCUDA_DEVICE_1`, ...
pub const DEVICE_ENV_PREFIX: &str = "RCUDA_DEVICE_";

/// DevicePlugin service implementation
///
/// All clients share the same live device set and the session's stop token.
#[derive(Debug, Clone)]
pub struct DevicePluginService {
    state: Arc<DeviceState>,
    options: DevicePluginOptions,
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(state: Arc<DeviceState>, cancellation_token: CancellationToken) -> Self {
        Self {
            state,
            options: plugin_options(),
            cancellation_token,
        }
    }
}

/// Options advertised at registration and through `GetDevicePluginOptions`.
///
/// Neither `PreStartContainer` nor `GetPreferredAllocation` do any work, so
/// the kubelet is told not to call them.
pub(crate) fn plugin_options() -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: false,
    }
}

/// Builds the container environments for an allocation.
///
/// Either every requested id is known and one response per container request
/// is returned, or the first unknown id is returned and nothing is allocated.
pub fn allocate_containers(
    devices: &DeviceSet,
    requests: &[ContainerAllocateRequest],
) -> Result<Vec<ContainerAllocateResponse>, String> {
    if let Some(unknown) = requests
        .iter()
        .flat_map(|req| req.devices_ids.iter())
        .find(|id| !device_exists(devices, id))
    {
        return Err(unknown.clone());
    }

    Ok(requests
        .iter()
        .map(|req| {
            let mut envs = HashMap::with_capacity(req.devices_ids.len() + 1);
            envs.insert(
                DEVICE_COUNT_ENV.to_string(),
                req.devices_ids.len().to_string(),
            );
            for (index, id) in req.devices_ids.iter().enumerate() {
                envs.insert(format!("{DEVICE_ENV_PREFIX}{index}"), id.clone());
            }
            ContainerAllocateResponse {
                envs,
                ..Default::default()
            }
        })
        .collect())
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(self.options))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Sends the device list once, then again after every health change
    /// until the plugin stops or the client goes away.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        let (tx, rx) = mpsc::channel(4);
        let state = self.state.clone();
        let cancellation_token = self.cancellation_token.clone();
        let mut changes = state.subscribe();

        tokio::spawn(async move {
            changes.borrow_and_update();
            let initial = ListAndWatchResponse {
                devices: state.read().await.to_api(),
            };
            if tx.send(Ok(initial)).await.is_err() {
                debug!("client went away before the initial device list");
                return;
            }

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("device plugin stopped, closing device list stream");
                        break;
                    }
                    _ = tx.closed() => {
                        debug!("device list stream closed by client");
                        break;
                    }
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let update = ListAndWatchResponse {
                            devices: state.read().await.to_api(),
                        };
                        if tx.send(Ok(update)).await.is_err() {
                            debug!("client went away, dropping device list update");
                            break;
                        }
                    }
                }
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!("allocating devices to containers: {:?}", req);

        let devices = self.state.read().await;
        let container_responses =
            allocate_containers(&devices, &req.container_requests).map_err(|id| {
                warn!(device = %id, "rejecting allocation of unknown device");
                Status::invalid_argument(format!(
                    "invalid allocation request: unknown device: {id}"
                ))
            })?;

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::device::Device;

    fn devices() -> DeviceSet {
        DeviceSet::from_iter([
            Device::on_host("h1", "0"),
            Device::on_host("h1", "1"),
            Device::on_host("h2", "0"),
        ])
    }

    fn request(ids: &[&str]) -> ContainerAllocateRequest {
        ContainerAllocateRequest {
            devices_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn allocation_exposes_devices_in_request_order() {
        let responses = allocate_containers(
            &devices(),
            &[request(&["h2:0", "h1:0"]), request(&["h1:1"])],
        )
        .expect("should allocate");

        assert_eq!(responses.len(), 2);
        assert_eq!(
            responses[0].envs,
            HashMap::from([
                ("RCUDA_DEVICE_COUNT".to_string(), "2".to_string()),
                ("RCUDA_DEVICE_0".to_string(), "h2:0".to_string()),
                ("RCUDA_DEVICE_1".to_string(), "h1:0".to_string()),
            ])
        );
        assert_eq!(
            responses[1].envs,
            HashMap::from([
                ("RCUDA_DEVICE_COUNT".to_string(), "1".to_string()),
                ("RCUDA_DEVICE_0".to_string(), "h1:1".to_string()),
            ])
        );
        assert!(responses[0].devices.is_empty());
        assert!(responses[0].mounts.is_empty());
    }

    #[test]
    fn one_unknown_device_fails_the_whole_batch() {
        let result = allocate_containers(
            &devices(),
            &[request(&["h1:0"]), request(&["h1:1", "h3:0"])],
        );

        assert_eq!(result, Err("h3:0".to_string()));
    }

    #[test]
    fn empty_container_request_gets_zero_count() {
        let responses = allocate_containers(&devices(), &[request(&[])]).expect("allocate");

        assert_eq!(
            responses[0].envs,
            HashMap::from([("RCUDA_DEVICE_COUNT".to_string(), "0".to_string())])
        );
    }

    #[test(tokio::test)]
    async fn allocate_rpc_reports_unknown_device() {
        let service = DevicePluginService::new(DeviceState::new(devices()), CancellationToken::new());

        let status = service
            .allocate(Request::new(AllocateRequest {
                container_requests: vec![request(&["h1:0"]), request(&["h1:7"])],
            }))
            .await
            .expect_err("should reject");

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(
            status.message(),
            "invalid allocation request: unknown device: h1:7"
        );
    }

    #[test(tokio::test)]
    async fn options_and_pre_start_are_empty() {
        let service = DevicePluginService::new(DeviceState::new(devices()), CancellationToken::new());

        let options = service
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .expect("options")
            .into_inner();
        assert_eq!(options, DevicePluginOptions::default());

        service
            .pre_start_container(Request::new(PreStartContainerRequest {
                devices_ids: vec!["h1:0".to_string()],
            }))
            .await
            .expect("pre-start");

        let preferred = service
            .get_preferred_allocation(Request::new(PreferredAllocationRequest::default()))
            .await
            .expect("preferred")
            .into_inner();
        assert!(preferred.container_responses.is_empty());
    }

    #[test(tokio::test)]
    async fn stream_follows_health_changes_until_stopped() {
        use futures::StreamExt;

        let state = DeviceState::new(devices());
        let token = CancellationToken::new();
        let service = DevicePluginService::new(state.clone(), token.clone());

        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("stream")
            .into_inner();

        let initial = stream.next().await.expect("initial").expect("ok");
        assert!(initial.devices.iter().all(|d| d.health == "Healthy"));

        state.mark_unhealthy("h1:1").await;
        let update = stream.next().await.expect("update").expect("ok");
        let health: Vec<_> = update
            .devices
            .iter()
            .map(|d| (d.id.as_str(), d.health.as_str()))
            .collect();
        assert_eq!(
            health,
            vec![("h1:0", "Healthy"), ("h1:1", "Unhealthy"), ("h2:0", "Healthy")]
        );

        token.cancel();
        assert!(stream.next().await.is_none());
    }

    #[test(tokio::test)]
    async fn every_stream_sees_health_changes_and_stop() {
        use futures::StreamExt;

        let state = DeviceState::new(devices());
        let token = CancellationToken::new();
        let service = DevicePluginService::new(state.clone(), token.clone());

        let mut streams = Vec::new();
        for _ in 0..2 {
            let mut stream = service
                .list_and_watch(Request::new(Empty {}))
                .await
                .expect("stream")
                .into_inner();
            let initial = stream.next().await.expect("initial").expect("ok");
            assert_eq!(initial.devices.len(), 3);
            streams.push(stream);
        }

        state.mark_unhealthy("h2:0").await;
        for stream in &mut streams {
            let update = stream.next().await.expect("update").expect("ok");
            let unhealthy: Vec<_> = update
                .devices
                .iter()
                .filter(|d| d.health == "Unhealthy")
                .map(|d| d.id.as_str())
                .collect();
            assert_eq!(unhealthy, vec!["h2:0"]);
        }

        token.cancel();
        for stream in &mut streams {
            assert!(stream.next().await.is_none());
        }
    }
}
