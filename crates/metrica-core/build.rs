// Generates the gRPC client and server stubs for the metrics service.
//
// Message types are declared by hand in `src/grpc.rs` with prost derives,
// so the manual builder is used and no protoc install is required.

use tonic_build::manual::{Builder, Method, Service};

fn main() {
    let service = Service::builder()
        .name("Metrics")
        .package("metrica.v1")
        .method(
            Method::builder()
                .name("update_metric")
                .route_name("UpdateMetric")
                .input_type("crate::grpc::UpdateMetricRequest")
                .output_type("crate::grpc::UpdateMetricResponse")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .method(
            Method::builder()
                .name("get_metric")
                .route_name("GetMetric")
                .input_type("crate::grpc::GetMetricRequest")
                .output_type("crate::grpc::GetMetricResponse")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .build();

    Builder::new().compile(&[service]);
}
