use colored::Colorize;
use tidal_core::Core;
use tidal_drive::Drive;
use tidal_mirror::{DiffOp, DiffRecord, MirrorReport};

/// `+ /key [added, -removed]`
pub fn record_line(record: &DiffRecord) -> String {
    format!(
        "{} {} [{}, -{}]",
        record.op.symbol(),
        record.key,
        record.bytes_added,
        record.bytes_removed
    )
}

pub fn print_record(record: &DiffRecord) {
    let line = record_line(record);
    let line = match record.op {
        DiffOp::Add => line.green(),
        DiffOp::Remove => line.red(),
        DiffOp::Change => line.yellow(),
    };
    println!("{line}");
}

pub fn core_line(label: &str, core: &Core) -> String {
    format!(
        "{label}: {} length={} bytes={} tree={}",
        core.id(),
        core.length(),
        core.byte_length(),
        core.tree_hash()
    )
}

pub fn print_drive(label: &str, drive: &Drive) {
    println!("{}", core_line(&format!("{label} db"), drive.metadata()).cyan());
    println!("{}", core_line(&format!("{label} blobs"), drive.blobs().core()).cyan());
}

pub fn print_summary(report: &MirrorReport, version: &str) {
    println!();
    println!(
        "total changes {} ({} added, {} removed, {} changed)",
        report.len().to_string().bold(),
        report.count(DiffOp::Add),
        report.count(DiffOp::Remove),
        report.count(DiffOp::Change)
    );
    println!("version: {}", version.yellow().bold());
    println!();
}

pub fn notice(message: &str) {
    println!("{}", message.bold());
}

pub fn warning(message: &str) {
    println!("{}", message.red().bold());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, op: DiffOp, added: u64, removed: u64) -> DiffRecord {
        DiffRecord {
            key: key.into(),
            op,
            bytes_added: added,
            bytes_removed: removed,
        }
    }

    #[test]
    fn record_lines() {
        assert_eq!(record_line(&record("/a", DiffOp::Add, 3, 0)), "+ /a [3, -0]");
        assert_eq!(record_line(&record("/c", DiffOp::Remove, 0, 9)), "- /c [0, -9]");
        assert_eq!(
            record_line(&record("/b", DiffOp::Change, 5, 2)),
            "~ /b [5, -2]"
        );
    }

    #[tokio::test]
    async fn core_line_names_core() {
        let core = tidal_core::CoreStore::memory().open_writable("db").unwrap();
        core.append(bytes::Bytes::from_static(b"abc")).await.unwrap();
        let line = core_line("release db", &core);
        assert!(line.starts_with("release db: "));
        assert!(line.contains(&core.id()));
        assert!(line.contains("length=1 bytes=3"));
        assert!(line.contains(&core.tree_hash().to_hex()));
    }
}
