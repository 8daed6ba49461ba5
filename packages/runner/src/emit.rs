// ABOUTME: Writes NDJSON runner events to the one-shot output stream
// ABOUTME: Flushes after every event so the host sees progress as it happens

use crate::error::Result;
use codebox_protocol::RunnerEvent;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub async fn emit<W>(out: &mut W, event: &RunnerEvent) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    out.write_all(event.to_line()?.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}
