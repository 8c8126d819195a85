//! Table and JSON rendering for list operations.

use chrono::Local;
use serde::Serialize;
use std::io::{self, Write};

use crate::types::{CloudImage, CloudInstance, NanosVolume};
use crate::units::human_size;

/// Render images as a table, or as JSON when `json` is set.
pub fn images<W: Write>(out: &mut W, images: &[CloudImage], json: bool) -> io::Result<()> {
    if json {
        return write_json(out, images);
    }
    let rows = images
        .iter()
        .map(|i| {
            vec![
                i.name.clone(),
                i.status.clone(),
                i.path.clone(),
                if i.size > 0 { human_size(i.size as u64) } else { String::new() },
                i.created_at
                    .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default(),
            ]
        })
        .collect();
    table(out, &["NAME", "STATUS", "PATH", "SIZE", "CREATED"], rows)
}

/// Render instances as a table, or as JSON when `json` is set.
pub fn instances<W: Write>(out: &mut W, instances: &[CloudInstance], json: bool) -> io::Result<()> {
    if json {
        return write_json(out, instances);
    }
    let rows = instances
        .iter()
        .map(|i| {
            vec![
                i.id.clone(),
                i.name.clone(),
                i.status.clone(),
                i.created.clone(),
                i.private_ips.join(", "),
                i.public_ips.join(", "),
                i.image.clone(),
            ]
        })
        .collect();
    table(
        out,
        &["ID", "NAME", "STATUS", "CREATED", "PRIVATE IPS", "PUBLIC IPS", "IMAGE"],
        rows,
    )
}

/// Render volumes as a table, or as JSON when `json` is set.
pub fn volumes<W: Write>(out: &mut W, volumes: &[NanosVolume], json: bool) -> io::Result<()> {
    if json {
        return write_json(out, volumes);
    }
    let rows = volumes
        .iter()
        .map(|v| {
            vec![
                v.id.clone(),
                v.name.clone(),
                v.size.clone(),
                v.path.clone(),
                v.created_at.clone(),
                v.attached_to.clone(),
            ]
        })
        .collect();
    table(out, &["ID", "NAME", "SIZE", "PATH", "CREATED", "ATTACHED"], rows)
}

fn write_json<W: Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)
}

fn table<W: Write>(out: &mut W, headers: &[&str], rows: Vec<Vec<String>>) -> io::Result<()> {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let header: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    write_row(out, &header, &widths)?;
    for row in &rows {
        write_row(out, row, &widths)?;
    }
    Ok(())
}

fn write_row<W: Write>(out: &mut W, cells: &[String], widths: &[usize]) -> io::Result<()> {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
        .collect::<Vec<_>>()
        .join("  ");
    writeln!(out, "{}", line.trim_end())
}
