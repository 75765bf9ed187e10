/// eADR detection.
///
/// Walk `/sys/bus/nd/devices` looking for nvdimm regions; the platform
/// auto-flushes CPU caches on power failure only if every region reports a
/// `persistence_domain` of `cpu_cache`. Missing directory, no regions, or
/// any other domain value means no eADR.
use std::path::Path;

const BUS_DEVICE_PATH: &str = "/sys/bus/nd/devices";

fn region_has_cpu_cache(region: &Path) -> bool {
    let domain_path = region.join("persistence_domain");
    match std::fs::read_to_string(&domain_path) {
        Ok(domain) => {
            let domain = domain.trim_end();
            log::trace!("detected persistence_domain: {}", domain);
            domain == "cpu_cache"
        }
        Err(e) => {
            log::info!("{}: {}", domain_path.display(), e);
            false
        }
    }
}

/// True iff the platform reports auto-flush for all nvdimm regions.
pub fn detect() -> bool {
    let entries = match std::fs::read_dir(BUS_DEVICE_PATH) {
        Ok(entries) => entries,
        Err(_) => {
            log::info!("eADR not supported");
            return false;
        }
    };

    let mut cpu_cache = false;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().contains("region") {
            continue;
        }
        if !region_has_cpu_cache(&entry.path()) {
            return false;
        }
        cpu_cache = true;
    }

    cpu_cache
}
