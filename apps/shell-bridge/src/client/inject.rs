use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

use crate::session::SessionHandle;

/// Delivers each line from `reader` through `write_to_terminal`, the same port dictated
/// text uses. With `submit`, every line ends in a carriage return so the shell runs it.
/// Returns the number of lines handed to the session.
pub async fn pump_lines<R>(
    reader: R,
    handle: &SessionHandle,
    submit: bool,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut delivered = 0;
    while let Some(line) = lines.next_line().await? {
        let text = if submit { format!("{line}\r") } else { line };
        debug!(target = "client::inject", bytes = text.len(), "injecting line");
        handle.write_to_terminal(text);
        delivered += 1;
    }
    Ok(delivered)
}
