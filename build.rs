//! Generates the `submission.Submission` gRPC client and server. The message types are
//! hand-declared in `src/messages.rs`, so no `protoc` is needed.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";
const REQUEST: &str = "crate::messages::SnapshotSubmission";
const RESPONSE: &str = "crate::messages::SubmissionResponse";

fn method(name: &'static str, route: &'static str) -> tonic_build::manual::MethodBuilder {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(REQUEST)
        .output_type(RESPONSE)
        .codec_path(CODEC)
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let submission = Service::builder()
        .name("Submission")
        .package("submission")
        .method(method("submit_snapshot", "SubmitSnapshot").build())
        .method(
            method("submit_snapshot_simulation", "SubmitSnapshotSimulation")
                .client_streaming()
                .build(),
        )
        .method(
            method("stream_snapshots", "StreamSnapshots")
                .client_streaming()
                .server_streaming()
                .build(),
        )
        .build();

    Builder::new().compile(&[submission]);
}
