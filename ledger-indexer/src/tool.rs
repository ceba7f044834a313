use daemonize::Daemonize;
use std::fs::File;
use std::path::Path;

pub fn clear_db_files(data_dir: &Path) -> Result<(), String> {
    if data_dir.exists() {
        std::fs::remove_dir_all(data_dir).map_err(|e| {
            let msg = format!(
                "Could not delete database directory at {}: {}",
                data_dir.display(),
                e
            );
            error!("{}", msg);
            msg
        })?;
        info!("Deleted database directory at {}", data_dir.display());
        println!("Deleted database directory at {}", data_dir.display());
    } else {
        println!("Database directory does not exist at {}", data_dir.display());
    }

    Ok(())
}

pub fn daemonize_process(service_name: &str) {
    let root_dir = ledger_util::get_service_dir(service_name);
    if let Err(e) = std::fs::create_dir_all(&root_dir) {
        println!("Failed to create service directory {}: {}", root_dir.display(), e);
        std::process::exit(1);
    }

    let (stdout, stderr) = match (File::open("/dev/null"), File::open("/dev/null")) {
        (Ok(stdout), Ok(stderr)) => (stdout, stderr),
        (Err(e), _) | (_, Err(e)) => {
            println!("Failed to open /dev/null: {}", e);
            std::process::exit(1);
        }
    };

    let pid_file = root_dir.join(format!("{}.pid", service_name));
    let daemonize = Daemonize::new()
        .pid_file(pid_file)
        .chown_pid_file(true)
        .stdout(stdout)
        .stderr(stderr)
        .working_directory(root_dir);

    match daemonize.start() {
        Ok(_) => {
            info!("{} service daemonized successfully", service_name);
        }
        Err(e) => {
            println!("Error daemonizing {} service: {}", service_name, e);
            std::process::exit(1);
        }
    }
}
