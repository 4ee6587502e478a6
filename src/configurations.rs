//! A module that contains functions required to read, parse and return the
//! cluster settings from the file `Config.toml` at the root of this crate.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use config::{Config, File};

/// Where the cluster meets and how big it is. The quorum is the majority of
/// the configured size.
#[derive(Debug, Clone, Copy)]
pub struct ClusterSettings {
    pub group: SocketAddrV4,
    pub size: usize,
    pub quorum_size: usize,
}

pub fn get_config(file_name: &str) -> ClusterSettings {
    let c = read_config(file_name);
    parse_config(&c)
}

fn read_config(file_name: &str) -> HashMap<String, HashMap<String, String>> {
    let mut c = Config::default();
    c.merge(File::with_name(file_name)).unwrap();
    c.try_into::<HashMap<String, HashMap<String, String>>>().expect("Could not try_into")
}

fn parse_config(c: &HashMap<String, HashMap<String, String>>) -> ClusterSettings {
    let cluster = &c["cluster"];
    let size: usize = cluster["size"].parse().unwrap();

    ClusterSettings {
        group: SocketAddrV4::new(
            Ipv4Addr::from_str(&cluster["host"]).unwrap(),
            cluster["port"].parse().unwrap(),
        ),
        size,
        quorum_size: size / 2 + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn reads_the_cluster_section() {
        let base = std::env::temp_dir().join(format!("zpax-config-test-{}", std::process::id()));
        let file = base.with_extension("toml");
        fs::write(
            &file,
            "[cluster]\nhost = \"239.255.42.99\"\nport = \"7878\"\nsize = \"5\"\n",
        )
        .unwrap();

        let settings = get_config(base.to_str().unwrap());
        assert_eq!(
            settings.group,
            SocketAddrV4::new(Ipv4Addr::new(239, 255, 42, 99), 7878)
        );
        assert_eq!(settings.size, 5);
        assert_eq!(settings.quorum_size, 3);

        let _ = fs::remove_file(&file);
    }
}
