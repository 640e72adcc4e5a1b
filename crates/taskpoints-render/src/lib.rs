//! Plain-text and CSV renderings shared by the digest, the service and the CLI.

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to write CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV output was not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Failed to flush CSV writer: {0}")]
    Flush(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestLine {
    /// Local day the task was approved on.
    pub date: NaiveDate,
    pub title: String,
    pub points: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLine {
    pub username: String,
    pub title: String,
    pub points: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardLine {
    pub full_name: String,
    pub points: i64,
    pub level: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyPointsLine {
    pub username: String,
    pub date: NaiveDate,
    pub points_earned: i64,
}

pub fn render_user_digest(full_name: &str, date: NaiveDate, lines: &[DigestLine]) -> RenderedMessage {
    let name = if full_name.trim().is_empty() {
        "there"
    } else {
        full_name.trim()
    };
    let total: i64 = lines.iter().map(|line| line.points).sum();
    let mut body = Vec::new();
    body.push(format!("Hello {},", name));
    body.push(String::new());
    // One section per approval day; catch-up runs can settle several.
    let mut current = None;
    for line in lines {
        if current != Some(line.date) {
            if current.is_some() {
                body.push(String::new());
            }
            body.push(format!("Tasks you completed on {}:", line.date.format("%Y-%m-%d")));
            body.push(String::new());
            current = Some(line.date);
        }
        body.push(format!("• {} → {} {}", line.title.trim(), line.points, points_word(line.points)));
    }
    body.push(String::new());
    body.push(format!("Total: {} {}", total, points_word(total)));

    RenderedMessage {
        subject: format!("{} daily task summary", date.format("%Y-%m-%d")),
        body: finalize(body),
    }
}

pub fn render_admin_digest(
    date: NaiveDate,
    pending_tasks: &[PendingLine],
    pending_goals: &[PendingLine],
) -> RenderedMessage {
    let mut body = Vec::new();
    body.push(format!(
        "Items waiting for approval as of {}:",
        date.format("%Y-%m-%d")
    ));
    push_pending_section(&mut body, "Tasks", pending_tasks);
    push_pending_section(&mut body, "Goals", pending_goals);

    RenderedMessage {
        subject: format!(
            "{} pending approvals ({})",
            date.format("%Y-%m-%d"),
            pending_tasks.len() + pending_goals.len()
        ),
        body: finalize(body),
    }
}

pub fn leaderboard_table(rows: &[LeaderboardLine]) -> String {
    if rows.is_empty() {
        return "(no users)\n".to_string();
    }
    let name_width = rows
        .iter()
        .map(|row| row.full_name.chars().count())
        .max()
        .unwrap_or(0)
        .max("Name".len());
    let mut lines = Vec::new();
    lines.push(format!(
        "{:>4}  {:<width$}  {:>6}  {:>5}",
        "#",
        "Name",
        "Points",
        "Level",
        width = name_width
    ));
    for (idx, row) in rows.iter().enumerate() {
        lines.push(format!(
            "{:>4}  {:<width$}  {:>6}  {:>5}",
            idx + 1,
            row.full_name,
            row.points,
            row.level,
            width = name_width
        ));
    }
    finalize(lines)
}

pub fn daily_points_csv(rows: &[DailyPointsLine]) -> Result<String, RenderError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["username", "date", "pointsEarned"])?;
    for row in rows {
        writer.write_record([
            row.username.clone(),
            row.date.format("%Y-%m-%d").to_string(),
            row.points_earned.to_string(),
        ])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| RenderError::Flush(err.to_string()))?;
    Ok(String::from_utf8(bytes)?)
}

fn push_pending_section(body: &mut Vec<String>, heading: &str, items: &[PendingLine]) {
    body.push(String::new());
    body.push(format!("{}:", heading));
    if items.is_empty() {
        body.push("- none".to_string());
        return;
    }
    for item in items {
        body.push(format!(
            "- {} ({}) → {} {}",
            item.title.trim(),
            item.username,
            item.points,
            points_word(item.points)
        ));
    }
}

fn points_word(points: i64) -> &'static str {
    if points == 1 {
        "point"
    } else {
        "points"
    }
}

fn finalize(lines: Vec<String>) -> String {
    let mut result = lines.join("\n");
    result.push('\n');
    result
}
