use axum::http::StatusCode;
use petpal::StateSnapshot;
use std::fmt::Write;

/// The control page: live stream, current feeding time, control forms and
/// the day's log, oldest entry first.
pub fn render_index(snapshot: &StateSnapshot) -> String {
    let mut log = String::new();
    if snapshot.log.is_empty() {
        log.push_str("    <li>No detections yet.</li>\n");
    }
    for entry in &snapshot.log {
        let _ = writeln!(log, "    <li>{}</li>", escape(&entry.to_string()));
    }

    format!(
        r#"<html>
<head><title>PetPal</title></head>
<body>
<h1>PetPal!</h1>
<img src="/video_feed" width="640" height="480"><br><br>
<h2>Current Feeding Time: {feeding_time}</h2>
<form method="POST" action="/">
    <label>Set Feeding Time (HH:MM:SS):</label>
    <input type="text" name="feeding_time" required>
    <input type="submit" value="Update Alarm">
</form>

<br>
<form method="POST" action="/manual_trigger">
    <button type="submit">Feed Now</button>
</form>

<form method="POST" action="/reset">
    <button type="submit">Reset</button>
</form>

<form method="POST" action="/shutdown">
    <button type="submit">Kill App</button>
</form>

<h3>Log</h3>
<ul>
{log}</ul>
</body>
</html>
"#,
        feeding_time = snapshot.feeding_time.format(petpal::FEEDING_TIME_FORMAT),
    )
}

pub fn render_error(status: StatusCode, message: &str) -> String {
    format!(
        r#"<html>
<head><title>PetPal</title></head>
<body>
<h1>{status}</h1>
<p>{message}</p>
<a href="/">Back</a>
</body>
</html>
"#,
        message = escape(message),
    )
}

pub fn render_shutdown() -> &'static str {
    "<html>\n<head><title>PetPal</title></head>\n<body>\n<h1>PetPal is shutting down.</h1>\n</body>\n</html>\n"
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use petpal::DetectionEvent;

    fn snapshot(log: Vec<DetectionEvent>) -> StateSnapshot {
        StateSnapshot {
            feeding_time: NaiveTime::from_hms_opt(7, 30, 0).unwrap(),
            last_reset_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            activated_today: false,
            log,
        }
    }

    #[test]
    fn empty_log_shows_placeholder() {
        let html = render_index(&snapshot(Vec::new()));
        assert!(html.contains("Current Feeding Time: 07:30:00"));
        assert!(html.contains("<li>No detections yet.</li>"));
    }

    #[test]
    fn log_entries_render_in_order() {
        let at = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(7, 31, 0)
            .unwrap();
        let html = render_index(&snapshot(vec![
            DetectionEvent::detected(at, "dog"),
            DetectionEvent::dispensed(at, petpal::ActuationOrigin::Scheduled),
        ]));
        let detected = html.find("Dog detected at 2024-05-01 07:31:00").unwrap();
        let dispensed = html.find("Food dispensed at 2024-05-01 07:31:00").unwrap();
        assert!(detected < dispensed);
        assert!(!html.contains("No detections yet."));
    }

    #[test]
    fn error_messages_are_escaped() {
        let html = render_error(StatusCode::BAD_REQUEST, "<script>");
        assert!(html.contains("400 Bad Request"));
        assert!(html.contains("&lt;script&gt;"));
    }
}
