//! Domain descriptor parser.
//!
//! Turns one hypervisor domain descriptor into a normalized [`Domain`].
//! KVM, Xen HVM and both Xen PV boot styles share the same document shape;
//! their differences are absorbed here so nothing downstream has to care
//! which dialect a domain came from.

use std::collections::BTreeMap;

use vmmd_proto::{Disk, Domain, DomainType, Graphics, Interface, AUTOPORT};

use crate::error::DescriptorError;
use crate::tree::{self, Element};

/// Defaults applied where a descriptor is silent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserOptions {
    /// Used when `os/type@arch` is missing (Xen PV)
    pub default_arch: String,
    /// Used when `graphics@keymap` is missing
    pub default_keymap: String,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            default_arch: platform_arch(),
            default_keymap: vmmd_common::default_keymap(),
        }
    }
}

impl ParserOptions {
    pub fn new(default_arch: impl Into<String>, default_keymap: impl Into<String>) -> Self {
        Self {
            default_arch: default_arch.into(),
            default_keymap: default_keymap.into(),
        }
    }
}

/// Architecture name of the running platform in hypervisor spelling.
pub fn platform_arch() -> String {
    match std::env::consts::ARCH {
        "x86" => "i686",
        "powerpc64" => "ppc64",
        other => other,
    }
    .to_string()
}

/// Parse one domain descriptor.
///
/// Fails without returning a partially filled domain; callers polling a
/// whole node skip the offending domain and carry on.
pub fn parse_domain(xml: &str, options: &ParserOptions) -> Result<Domain, DescriptorError> {
    let root = tree::parse(xml)?;
    if root.name != "domain" {
        return Err(DescriptorError::UnexpectedRoot {
            found: root.name,
            expected: "domain",
        });
    }
    DomainReader { root: &root, options }.read()
}

struct DomainReader<'a> {
    root: &'a Element,
    options: &'a ParserOptions,
}

impl<'a> DomainReader<'a> {
    fn read(&self) -> Result<Domain, DescriptorError> {
        let root = self.root;
        let name = text_of(root, "name");
        let uuid = text_of(root, "uuid");

        let type_name = root.attr("type").unwrap_or_default();
        let domain_type = DomainType::from_name(type_name).ok_or_else(|| {
            DescriptorError::UnsupportedDomainType {
                found: type_name.to_string(),
                domain: self.label(),
            }
        })?;

        let mut domain = Domain {
            domain_type,
            name,
            uuid,
            ..Domain::default()
        };

        self.read_os(&mut domain);

        // Siblings of <os>, Xen PV only
        domain.bootloader = text_of(root, "bootloader");
        domain.bootloader_args = verbatim_text_of(root, "bootloader_args");

        domain.rtc_offset = root.child_attr("clock", "offset").unwrap_or_default().to_string();

        if let Some(memory) = root.child("memory") {
            domain.max_mem = self.read_memory(memory, "memory")?;
        }
        domain.cur_mem = match root.child("currentMemory") {
            Some(memory) => self.read_memory(memory, "currentMemory")?,
            None => domain.max_mem,
        };
        if let Some(vcpu) = root.child("vcpu") {
            let text = vcpu.trimmed_text();
            domain.vcpus = text.parse().map_err(|_| self.invalid("vcpu", "text", text))?;
        }

        if let Some(description) = root.child_text("description").filter(|d| !d.is_empty()) {
            domain.annotations = BTreeMap::from([("description".to_string(), description.to_string())]);
        }

        if let Some(devices) = root.child("devices") {
            domain.disks = devices.children_named("disk").map(read_disk).collect();
            domain.interfaces = devices.children_named("interface").map(read_interface).collect();
            domain.graphics = devices
                .children_named("graphics")
                .map(|g| self.read_graphics(g))
                .collect::<Result<_, _>>()?;
        }

        domain.targethosts = self.read_targethosts();

        Ok(domain)
    }

    fn read_os(&self, domain: &mut Domain) {
        let Some(os) = self.root.child("os") else {
            domain.os_type = String::new();
            domain.arch = self.options.default_arch.clone();
            return;
        };

        let os_type = os.child("type");
        domain.os_type = os_type.map(|t| t.trimmed_text().to_string()).unwrap_or_default();
        domain.arch = os_type
            .and_then(|t| t.attr("arch"))
            .filter(|arch| !arch.is_empty())
            .unwrap_or(self.options.default_arch.as_str())
            .to_string();

        domain.boot = os
            .children_named("boot")
            .filter_map(|b| b.attr("dev"))
            .map(str::to_string)
            .collect();

        domain.kernel = text_of(os, "kernel");
        domain.initrd = text_of(os, "initrd");
        domain.cmdline = verbatim_text_of(os, "cmdline");
    }

    fn read_memory(&self, element: &Element, name: &'static str) -> Result<u64, DescriptorError> {
        let text = element.trimmed_text();
        let amount: u64 = text.parse().map_err(|_| self.invalid(name, "text", text))?;
        let unit = element.attr("unit").unwrap_or("KiB");
        let scale = unit_scale(unit).ok_or_else(|| self.invalid(name, "unit", unit))?;
        amount
            .checked_mul(scale)
            .ok_or_else(|| self.invalid(name, "text", text))
    }

    fn read_graphics(&self, element: &Element) -> Result<Graphics, DescriptorError> {
        let port = match element.attr("port") {
            None => AUTOPORT,
            Some(port) => port
                .parse::<i32>()
                .map_err(|_| self.invalid("graphics", "port", port))?,
        };
        let autoport = match element.attr("autoport") {
            Some(value) => value == "yes",
            None => port == AUTOPORT,
        };
        let listen = element
            .attr("listen")
            .or_else(|| element.child_attr("listen", "address"))
            .unwrap_or_default();

        Ok(Graphics {
            graphics_type: element.attr("type").unwrap_or_default().to_string(),
            port,
            autoport,
            listen: listen.to_string(),
            passwd: element.attr("passwd").unwrap_or_default().to_string(),
            keymap: element
                .attr("keymap")
                .unwrap_or(self.options.default_keymap.as_str())
                .to_string(),
        })
    }

    /// `metadata/*:migrationtargethosts/hostname`, whatever the namespace.
    fn read_targethosts(&self) -> Vec<String> {
        self.root
            .child("metadata")
            .and_then(|m| m.child("migrationtargethosts"))
            .map(|hosts| {
                hosts
                    .children_named("hostname")
                    .map(|h| h.trimmed_text().to_string())
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn label(&self) -> String {
        let name = self.root.child_text("name").unwrap_or_default();
        if !name.is_empty() {
            return name.to_string();
        }
        match self.root.child_text("uuid") {
            Some(uuid) if !uuid.is_empty() => uuid.to_string(),
            _ => "<unnamed>".to_string(),
        }
    }

    fn invalid(&self, element: &'static str, attribute: &'static str, value: &str) -> DescriptorError {
        DescriptorError::InvalidValue {
            element,
            attribute,
            value: value.to_string(),
            domain: self.label(),
        }
    }
}

fn read_disk(element: &Element) -> Disk {
    let disk_type = element.attr("type").unwrap_or("file").to_string();
    let source = element.child("source").and_then(|source| {
        let by_type = match disk_type.as_str() {
            "file" => source.attr("file"),
            "block" => source.attr("dev"),
            "dir" => source.attr("dir"),
            "network" => source.attr("protocol"),
            _ => None,
        };
        by_type
            .or_else(|| source.attr("file"))
            .or_else(|| source.attr("dev"))
            .or_else(|| source.attr("dir"))
    });

    Disk {
        device: element.attr("device").unwrap_or("disk").to_string(),
        driver: attr_of(element, "driver", "name"),
        driver_type: attr_of(element, "driver", "type"),
        driver_cache: attr_of(element, "driver", "cache"),
        source: source.unwrap_or_default().to_string(),
        target_dev: attr_of(element, "target", "dev"),
        target_bus: attr_of(element, "target", "bus"),
        readonly: element.child("readonly").is_some(),
        disk_type,
        ..Disk::default()
    }
}

fn read_interface(element: &Element) -> Interface {
    let iface_type = element.attr("type").unwrap_or("bridge").to_string();
    let source = element.child("source").and_then(|source| {
        let by_type = match iface_type.as_str() {
            "bridge" => source.attr("bridge"),
            "network" => source.attr("network"),
            "direct" | "ethernet" => source.attr("dev"),
            _ => None,
        };
        by_type
            .or_else(|| source.attr("bridge"))
            .or_else(|| source.attr("network"))
    });

    Interface {
        mac_address: attr_of(element, "mac", "address"),
        source: source.unwrap_or_default().to_string(),
        script: attr_of(element, "script", "path"),
        target: attr_of(element, "target", "dev"),
        model: attr_of(element, "model", "type"),
        iface_type,
    }
}

fn text_of(element: &Element, child: &str) -> String {
    element.child_text(child).unwrap_or_default().to_string()
}

fn verbatim_text_of(element: &Element, child: &str) -> String {
    element.child_text_verbatim(child).unwrap_or_default().to_string()
}

fn attr_of(element: &Element, child: &str, attr: &str) -> String {
    element.child_attr(child, attr).unwrap_or_default().to_string()
}

fn unit_scale(unit: &str) -> Option<u64> {
    const KIB: u64 = 1024;
    let scale = match unit {
        "b" | "bytes" => 1,
        "KB" => 1_000,
        "k" | "KiB" => KIB,
        "MB" => 1_000_000,
        "M" | "MiB" => KIB * KIB,
        "GB" => 1_000_000_000,
        "G" | "GiB" => KIB * KIB * KIB,
        "TB" => 1_000_000_000_000,
        "T" | "TiB" => KIB * KIB * KIB * KIB,
        _ => return None,
    };
    Some(scale)
}
