//! Line-based terminal front end.

use pulseform_models::FormData;

use crate::controller::ClientState;

const BAR_WIDTH: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Quit,
    Reset,
    Submit(FormData),
    Empty,
}

/// `/quit` and `/reset` are commands. Any other non-blank line is submitted
/// as the form message.
#[must_use]
pub fn parse_input(line: &str) -> Input {
    match line.trim() {
        "" => Input::Empty,
        "/quit" | "/exit" => Input::Quit,
        "/reset" => Input::Reset,
        message => Input::Submit(FormData::new(message)),
    }
}

#[must_use]
pub fn render(state: &ClientState) -> String {
    let progress = state.progress.min(100);
    let filled = usize::from(progress) * BAR_WIDTH / 100;
    let bar = format!("{}{}", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled));
    let connection = if state.connected {
        "connected"
    } else {
        "disconnected"
    };

    if state.status_message.is_empty() {
        format!("[{bar}] {progress:>3}% ({connection})")
    } else {
        format!(
            "[{bar}] {progress:>3}% ({connection}) {}",
            state.status_message
        )
    }
}
