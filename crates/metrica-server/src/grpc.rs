//! gRPC `Metrics` service and its trusted-subnet interceptor.

use metrica_core::MetricError;
use metrica_core::crypto::{REAL_IP_HEADER, SubnetError, TrustedSubnet};
use metrica_core::grpc::metrics_server::Metrics;
use metrica_core::grpc::{
    self, GetMetricRequest, GetMetricResponse, UpdateMetricRequest, UpdateMetricResponse,
    decode_kind,
};
use tonic::service::Interceptor;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use crate::state::AppState;

pub(crate) struct MetricsService {
    state: AppState,
}

impl MetricsService {
    pub(crate) fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl Metrics for MetricsService {
    #[instrument(skip_all, fields(id = tracing::field::Empty))]
    async fn update_metric(
        &self,
        request: Request<UpdateMetricRequest>,
    ) -> Result<Response<UpdateMetricResponse>, Status> {
        let metric = request.into_inner().into_metric()?;
        tracing::Span::current().record("id", metric.name.as_str());

        let stored = self.state.repo.set(metric).await?;
        self.state.written().await;
        debug!(value = %stored.value, "metric updated");
        Ok(Response::new(UpdateMetricResponse {
            metric: Some(grpc::Metric::from(&stored)),
        }))
    }

    #[instrument(skip_all, fields(id = tracing::field::Empty))]
    async fn get_metric(
        &self,
        request: Request<GetMetricRequest>,
    ) -> Result<Response<GetMetricResponse>, Status> {
        let GetMetricRequest { id, kind } = request.into_inner();
        tracing::Span::current().record("id", id.as_str());
        if id.is_empty() {
            return Err(MetricError::validation("metric id is empty").into());
        }
        let kind = decode_kind(kind)?;

        let metric = self.state.repo.get(&id).await?;
        if metric.kind() != kind {
            return Err(MetricError::NotFound(id).into());
        }
        Ok(Response::new(GetMetricResponse {
            metric: Some(grpc::Metric::from(&metric)),
        }))
    }
}

/// Logs every call and, when a subnet is configured, checks the `x-real-ip` metadata.
#[derive(Clone, Default)]
pub(crate) struct PeerFilter {
    subnet: Option<TrustedSubnet>,
}

impl PeerFilter {
    pub(crate) fn new(subnet: Option<TrustedSubnet>) -> Self {
        Self { subnet }
    }
}

impl Interceptor for PeerFilter {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        let peer = request
            .remote_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "-".to_owned());
        let real_ip = request
            .metadata()
            .get(REAL_IP_HEADER)
            .map(|v| v.to_str().unwrap_or_default());
        debug!(peer, real_ip = real_ip.unwrap_or("-"), "grpc call");

        let Some(subnet) = &self.subnet else {
            return Ok(request);
        };
        match subnet.check(real_ip) {
            Ok(_) => Ok(request),
            Err(e @ SubnetError::Malformed) => {
                warn!(peer, "rejected grpc call without a valid x-real-ip");
                Err(Status::invalid_argument(e.to_string()))
            }
            Err(e @ SubnetError::Denied(_)) => {
                warn!(peer, error = %e, "rejected grpc call from untrusted address");
                Err(Status::permission_denied(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use metrica_core::grpc::MetricType;
    use metrica_core::repository::MemStorage;
    use metrica_core::{Metric, MetricKind};
    use tonic::Code;

    fn service() -> MetricsService {
        MetricsService::new(AppState::new(Arc::new(MemStorage::new()), None))
    }

    fn update(metric: Metric) -> Request<UpdateMetricRequest> {
        Request::new(UpdateMetricRequest {
            metric: Some(grpc::Metric::from(&metric)),
        })
    }

    #[tokio::test]
    async fn update_echoes_running_total() {
        let svc = service();
        svc.update_metric(update(Metric::counter("hits", 2)))
            .await
            .unwrap();
        let echoed = svc
            .update_metric(update(Metric::counter("hits", 2)))
            .await
            .unwrap()
            .into_inner()
            .metric
            .unwrap();
        assert_eq!(echoed.delta, Some(4));
        assert_eq!(echoed.kind, MetricType::Counter as i32);
    }

    #[tokio::test]
    async fn update_rejects_bad_input() {
        let svc = service();
        let err = svc
            .update_metric(Request::new(UpdateMetricRequest { metric: None }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let mut bad = grpc::Metric::from(&Metric::gauge("temp", 1.0));
        bad.kind = MetricType::Unspecified as i32;
        let err = svc
            .update_metric(Request::new(UpdateMetricRequest { metric: Some(bad) }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn get_metric_codes() {
        let svc = service();
        svc.update_metric(update(Metric::gauge("temp", 3.5)))
            .await
            .unwrap();

        let found = svc
            .get_metric(Request::new(GetMetricRequest::new("temp", MetricKind::Gauge)))
            .await
            .unwrap()
            .into_inner()
            .metric
            .unwrap();
        assert_eq!(found.value, Some(3.5));

        let err = svc
            .get_metric(Request::new(GetMetricRequest::new("nope", MetricKind::Gauge)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        let err = svc
            .get_metric(Request::new(GetMetricRequest::new("temp", MetricKind::Counter)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        let err = svc
            .get_metric(Request::new(GetMetricRequest::new("", MetricKind::Gauge)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    fn call_with_ip(filter: &mut PeerFilter, ip: Option<&'static str>) -> Result<(), Code> {
        let mut request = Request::new(());
        if let Some(ip) = ip {
            request
                .metadata_mut()
                .insert(REAL_IP_HEADER, ip.parse().unwrap());
        }
        filter.call(request).map(|_| ()).map_err(|s| s.code())
    }

    #[test]
    fn peer_filter_checks_subnet() {
        let mut filter = PeerFilter::new(Some("10.0.0.0/8".parse().unwrap()));
        assert_eq!(call_with_ip(&mut filter, Some("10.1.2.3")), Ok(()));
        assert_eq!(
            call_with_ip(&mut filter, Some("192.168.1.1")),
            Err(Code::PermissionDenied)
        );
        assert_eq!(
            call_with_ip(&mut filter, Some("bogus")),
            Err(Code::InvalidArgument)
        );
        assert_eq!(call_with_ip(&mut filter, None), Err(Code::InvalidArgument));
    }

    #[test]
    fn peer_filter_without_subnet_passes_everything() {
        let mut filter = PeerFilter::default();
        assert_eq!(call_with_ip(&mut filter, None), Ok(()));
        assert_eq!(call_with_ip(&mut filter, Some("bogus")), Ok(()));
    }
}
