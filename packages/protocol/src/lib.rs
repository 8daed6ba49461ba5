// ABOUTME: Wire and on-disk contracts shared between the Codebox host and the guest runner
// ABOUTME: Job/request/response files, NDJSON runner events, manifests and the IPC directory layout

pub mod content_type;
pub mod error;
pub mod events;
pub mod job;
pub mod manifest;
pub mod queue;
pub mod response;
pub mod text;

pub use content_type::{content_type_for, is_image};
pub use error::{ProtocolError, Result};
pub use events::{ArtifactRef, RunnerEvent};
pub use job::{JobFile, RequestFile};
pub use manifest::{read_manifest, write_manifest, ManifestEntry, MANIFEST_FILE_NAME};
pub use queue::{
    parse_request_sequence, pending_requests, request_file_stem, write_json_atomic, IpcLayout,
    ReadyMarker,
};
pub use response::{ResponseFile, ResponseStatus};
pub use text::{truncate_tail, TailBuffer};
