//! Informes de detecciones y exportación del chat a Markdown.

use chrono::NaiveDateTime;
use std::collections::HashMap;

use crate::models::{ChatRole, ConversationTurn, DetectionRecord, ReportKind, ReportSummary};

/// Agrega las filas de un informe: totales, accidentes, infracciones de casco
/// y recuento por clase (de mayor a menor; a igual recuento, orden alfabético).
pub fn summarize(kind: ReportKind, rows: &[DetectionRecord]) -> ReportSummary {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut accident_count = 0;
    let mut helmet_count = 0;

    for row in rows {
        *counts.entry(row.class_label.as_str()).or_default() += 1;
        let lowered = row.class_label.to_lowercase();
        if lowered.contains("accident") {
            accident_count += 1;
        }
        if lowered.contains("without helmet") {
            helmet_count += 1;
        }
    }

    let mut class_counts: Vec<(String, usize)> =
        counts.into_iter().map(|(class, n)| (class.to_string(), n)).collect();
    class_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    ReportSummary {
        kind,
        title: kind.title().to_string(),
        total: rows.len(),
        accident_count,
        helmet_count,
        class_counts,
    }
}

/// Informe en Markdown, listo para adjuntar o convertir.
pub fn render_summary(summary: &ReportSummary) -> String {
    let mut out = format!("# {}\n\n", summary.title);
    if summary.total == 0 {
        out.push_str("✅ No records found for this report.\n");
        return out;
    }
    out.push_str(&format!(
        "In the selected period, a total of **{}** detections were recorded.\n\
         Out of these, **{}** were accidents and **{}** were helmet violations.\n\n",
        summary.total, summary.accident_count, summary.helmet_count
    ));
    out.push_str("| Class | Count |\n|---|---|\n");
    for (class, count) in &summary.class_counts {
        out.push_str(&format!("| {class} | {count} |\n"));
    }
    out
}

/// Convierte una tabla Markdown en filas de celdas. Descarta la línea
/// separadora (`|---|---|`) y las celdas vacías.
pub fn parse_markdown_table(md_table: &str) -> Vec<Vec<String>> {
    md_table
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !is_separator(line))
        .map(|line| {
            line.split('|')
                .map(str::trim)
                .filter(|cell| !cell.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|row| !row.is_empty())
        .collect()
}

fn is_separator(line: &str) -> bool {
    let body = line.trim_start_matches('|').trim_start();
    let dashes = body.chars().take_while(|c| *c == '-').count();
    dashes >= 3 && body[dashes..].trim_start().starts_with('|')
}

/// Un bloque de una respuesta del asistente: texto o tabla ya parseada.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBlock {
    Text(String),
    Table(Vec<Vec<String>>),
}

/// Separa una respuesta en líneas de texto y tablas (líneas consecutivas con `|`).
pub fn split_reply(content: &str) -> Vec<ReplyBlock> {
    fn flush(lines: &mut Vec<&str>, blocks: &mut Vec<ReplyBlock>) {
        if !lines.is_empty() {
            let table = parse_markdown_table(&lines.join("\n"));
            if !table.is_empty() {
                blocks.push(ReplyBlock::Table(table));
            }
            lines.clear();
        }
    }

    let mut blocks = Vec::new();
    let mut table_lines: Vec<&str> = Vec::new();

    for line in content.lines() {
        if line.contains('|') {
            table_lines.push(line);
        } else {
            flush(&mut table_lines, &mut blocks);
            if !line.trim().is_empty() {
                blocks.push(ReplyBlock::Text(line.trim().to_string()));
            }
        }
    }
    flush(&mut table_lines, &mut blocks);
    blocks
}

/// `true` si alguna línea está delimitada por `|` a ambos lados.
fn has_table(content: &str) -> bool {
    content.lines().any(|line| line.matches('|').count() >= 2)
}

/// Tabla con columnas alineadas, cabecera en la primera fila.
fn render_table(rows: &[Vec<String>]) -> String {
    let cols = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![3usize; cols];
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    let render_row = |row: &[String]| {
        let cells: Vec<String> = (0..cols)
            .map(|i| {
                let cell = row.get(i).map(String::as_str).unwrap_or("");
                format!("{cell:<width$}", width = widths[i])
            })
            .collect();
        format!("| {} |\n", cells.join(" | "))
    };

    let mut out = String::new();
    for (i, row) in rows.iter().enumerate() {
        out.push_str(&render_row(row));
        if i == 0 {
            let sep: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
            out.push_str(&format!("| {} |\n", sep.join(" | ")));
        }
    }
    out
}

/// Transcripción del chat en Markdown. Las tablas de las respuestas del
/// asistente se normalizan con columnas alineadas.
pub fn chat_transcript(history: &[ConversationTurn], generated_at: NaiveDateTime) -> String {
    let mut out = String::from("# 🛡️ SafeRideAI - Chat Report\n\n");
    out.push_str(&format!("{}\n\n", generated_at.format("%Y-%m-%d %H:%M:%S")));

    for turn in history {
        match turn.role {
            ChatRole::User => out.push_str(&format!("🧑 {}\n\n", turn.content)),
            ChatRole::Assistant if !has_table(&turn.content) => {
                out.push_str(&format!("🤖 {}\n\n", turn.content))
            }
            ChatRole::Assistant => {
                for block in split_reply(&turn.content) {
                    match block {
                        ReplyBlock::Text(text) => out.push_str(&format!("🤖 {text}\n\n")),
                        ReplyBlock::Table(rows) => {
                            out.push_str(&render_table(&rows));
                            out.push('\n');
                        }
                    }
                }
            }
        }
    }
    out
}
