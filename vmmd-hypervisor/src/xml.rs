//! XML generation for domain definitions.
//!
//! The inverse of [`crate::descriptor`]: renders a [`Domain`] as a
//! hypervisor descriptor. Parsing the output yields the same values for
//! every field the parser extracts.

use quick_xml::escape::escape;
use vmmd_proto::{Disk, Domain, DomainTemplate, Graphics, Interface};

/// Namespace of the migration target metadata block.
pub const METADATA_NS: &str = "urn:vmmd:metadata:1.0";

/// Builder for domain XML.
pub struct DomainXmlBuilder<'a> {
    domain: &'a Domain,
    template: Option<&'a DomainTemplate>,
}

impl<'a> DomainXmlBuilder<'a> {
    pub fn new(domain: &'a Domain) -> Self {
        Self { domain, template: None }
    }

    /// Use the emulator, machine type and loader of a node capability.
    pub fn with_template(mut self, template: Option<&'a DomainTemplate>) -> Self {
        self.template = template;
        self
    }

    /// Build the domain XML string.
    pub fn build(&self) -> String {
        let d = self.domain;
        let mut xml = String::new();

        xml.push_str(&format!("<domain type='{}'>\n", d.domain_type));
        xml.push_str(&format!("  <name>{}</name>\n", escape(&d.name)));
        if !d.uuid.is_empty() {
            xml.push_str(&format!("  <uuid>{}</uuid>\n", escape(&d.uuid)));
        }
        if !d.description().is_empty() {
            xml.push_str(&format!("  <description>{}</description>\n", escape(d.description())));
        }
        xml.push_str(&memory_element("memory", d.max_mem));
        if d.cur_mem > 0 {
            xml.push_str(&memory_element("currentMemory", d.cur_mem));
        }
        xml.push_str(&format!("  <vcpu placement='static'>{}</vcpu>\n", d.vcpus.max(1)));

        if !d.bootloader.is_empty() {
            xml.push_str(&format!("  <bootloader>{}</bootloader>\n", escape(&d.bootloader)));
        }
        if !d.bootloader_args.is_empty() {
            xml.push_str(&format!(
                "  <bootloader_args>{}</bootloader_args>\n",
                escape(&d.bootloader_args)
            ));
        }

        xml.push_str(&self.build_os_section());
        xml.push_str(&self.build_features_section());

        if !d.rtc_offset.is_empty() {
            xml.push_str(&format!("  <clock offset='{}'/>\n", escape(&d.rtc_offset)));
        }

        xml.push_str(
            r#"  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
"#,
        );

        xml.push_str("  <devices>\n");
        if let Some(emulator) = self.template.map(|t| t.emulator.as_str()).filter(|e| !e.is_empty()) {
            xml.push_str(&format!("    <emulator>{}</emulator>\n", escape(emulator)));
        }
        for disk in &d.disks {
            xml.push_str(&build_disk(disk));
        }
        for iface in &d.interfaces {
            xml.push_str(&build_interface(iface));
        }
        for graphics in &d.graphics {
            xml.push_str(&build_graphics(graphics));
        }
        xml.push_str("  </devices>\n");

        xml.push_str(&self.build_metadata());
        xml.push_str("</domain>\n");
        xml
    }

    fn build_os_section(&self) -> String {
        let d = self.domain;
        let mut xml = String::from("  <os>\n");

        let mut type_attrs = String::new();
        if !d.arch.is_empty() {
            type_attrs.push_str(&format!(" arch='{}'", escape(&d.arch)));
        }
        if let Some(machine) = self.template.and_then(|t| t.machines.first()) {
            type_attrs.push_str(&format!(" machine='{}'", escape(machine)));
        }
        xml.push_str(&format!("    <type{}>{}</type>\n", type_attrs, escape(&d.os_type)));

        if d.os_type == "hvm" {
            if let Some(loader) = self.template.and_then(|t| t.loader.as_deref()) {
                xml.push_str(&format!("    <loader>{}</loader>\n", escape(loader)));
            }
        }
        for (tag, value) in [("kernel", &d.kernel), ("initrd", &d.initrd), ("cmdline", &d.cmdline)] {
            if !value.is_empty() {
                xml.push_str(&format!("    <{tag}>{}</{tag}>\n", escape(value)));
            }
        }
        for dev in &d.boot {
            xml.push_str(&format!("    <boot dev='{}'/>\n", escape(dev)));
        }

        xml.push_str("  </os>\n");
        xml
    }

    fn build_features_section(&self) -> String {
        let features = self.template.map(|t| t.features.as_slice()).unwrap_or_default();
        if features.is_empty() {
            return String::new();
        }
        let mut xml = String::from("  <features>\n");
        for feature in features {
            xml.push_str(&format!("    <{}/>\n", feature));
        }
        xml.push_str("  </features>\n");
        xml
    }

    fn build_metadata(&self) -> String {
        if self.domain.targethosts.is_empty() {
            return String::new();
        }
        let mut xml = String::from("  <metadata>\n");
        xml.push_str(&format!(
            "    <vmmd:migrationtargethosts xmlns:vmmd='{}'>\n",
            METADATA_NS
        ));
        for host in &self.domain.targethosts {
            xml.push_str(&format!("      <vmmd:hostname>{}</vmmd:hostname>\n", escape(host)));
        }
        xml.push_str("    </vmmd:migrationtargethosts>\n  </metadata>\n");
        xml
    }
}

fn build_disk(disk: &Disk) -> String {
    let mut xml = format!(
        "    <disk type='{}' device='{}'>\n",
        escape(&disk.disk_type),
        escape(&disk.device)
    );

    if !disk.driver.is_empty() || !disk.driver_type.is_empty() || !disk.driver_cache.is_empty() {
        let mut attrs = String::new();
        for (name, value) in [
            ("name", &disk.driver),
            ("type", &disk.driver_type),
            ("cache", &disk.driver_cache),
        ] {
            if !value.is_empty() {
                attrs.push_str(&format!(" {}='{}'", name, escape(value)));
            }
        }
        xml.push_str(&format!("      <driver{}/>\n", attrs));
    }

    if !disk.source.is_empty() {
        let attr = match disk.disk_type.as_str() {
            "block" => "dev",
            "dir" => "dir",
            "network" => "protocol",
            _ => "file",
        };
        xml.push_str(&format!("      <source {}='{}'/>\n", attr, escape(&disk.source)));
    }

    if !disk.target_dev.is_empty() {
        let bus = if disk.target_bus.is_empty() {
            String::new()
        } else {
            format!(" bus='{}'", escape(&disk.target_bus))
        };
        xml.push_str(&format!("      <target dev='{}'{}/>\n", escape(&disk.target_dev), bus));
    }

    if disk.readonly {
        xml.push_str("      <readonly/>\n");
    }
    xml.push_str("    </disk>\n");
    xml
}

fn build_interface(iface: &Interface) -> String {
    let mut xml = format!("    <interface type='{}'>\n", escape(&iface.iface_type));
    if !iface.mac_address.is_empty() {
        xml.push_str(&format!("      <mac address='{}'/>\n", escape(&iface.mac_address)));
    }
    if !iface.source.is_empty() {
        let attr = match iface.iface_type.as_str() {
            "network" => "network",
            "direct" | "ethernet" => "dev",
            _ => "bridge",
        };
        xml.push_str(&format!("      <source {}='{}'/>\n", attr, escape(&iface.source)));
    }
    if !iface.script.is_empty() {
        xml.push_str(&format!("      <script path='{}'/>\n", escape(&iface.script)));
    }
    if !iface.target.is_empty() {
        xml.push_str(&format!("      <target dev='{}'/>\n", escape(&iface.target)));
    }
    if !iface.model.is_empty() {
        xml.push_str(&format!("      <model type='{}'/>\n", escape(&iface.model)));
    }
    xml.push_str("    </interface>\n");
    xml
}

fn build_graphics(graphics: &Graphics) -> String {
    let mut attrs = format!(" type='{}'", escape(&graphics.graphics_type));
    if graphics.autoport {
        attrs.push_str(" port='-1' autoport='yes'");
    } else {
        attrs.push_str(&format!(" port='{}' autoport='no'", graphics.port));
    }
    if !graphics.listen.is_empty() {
        attrs.push_str(&format!(" listen='{}'", escape(&graphics.listen)));
    }
    if !graphics.passwd.is_empty() {
        attrs.push_str(&format!(" passwd='{}'", escape(&graphics.passwd)));
    }
    if !graphics.keymap.is_empty() {
        attrs.push_str(&format!(" keymap='{}'", escape(&graphics.keymap)));
    }
    format!("    <graphics{}/>\n", attrs)
}

/// Memory in KiB when the byte count allows it, in bytes otherwise.
fn memory_element(tag: &str, bytes: u64) -> String {
    if bytes % 1024 == 0 {
        format!("  <{tag} unit='KiB'>{}</{tag}>\n", bytes / 1024)
    } else {
        format!("  <{tag} unit='b'>{bytes}</{tag}>\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{parse_domain, ParserOptions};
    use vmmd_proto::DomainType;

    fn sample() -> Domain {
        let mut domain = Domain::new("web & db");
        domain.uuid = "3c6a2f3e-3c1e-4d6b-8d65-2f4a9b1c0d11".to_string();
        domain.arch = "x86_64".to_string();
        domain.max_mem = 1024 * 1024 * 1024;
        domain.vcpus = 2;
        domain.boot = vec!["cdrom".to_string(), "hd".to_string()];
        domain.rtc_offset = "localtime".to_string();
        domain.targethosts = vec!["h1.example.com".to_string(), "h2.example.com".to_string()];
        domain.disks = vec![Disk {
            driver: "qemu".to_string(),
            driver_type: "qcow2".to_string(),
            source: "/var/lib/libvirt/images/web.qcow2".to_string(),
            target_dev: "vda".to_string(),
            target_bus: "virtio".to_string(),
            ..Disk::default()
        }];
        domain.interfaces = vec![Interface {
            mac_address: "52:54:00:12:34:56".to_string(),
            source: "br0".to_string(),
            model: "virtio".to_string(),
            ..Interface::default()
        }];
        domain.graphics = vec![Graphics {
            passwd: "s3'cret".to_string(),
            keymap: "fr".to_string(),
            listen: "0.0.0.0".to_string(),
            ..Graphics::default()
        }];
        domain
    }

    #[test]
    fn test_build_escapes_text_and_attributes() {
        let xml = DomainXmlBuilder::new(&sample()).build();
        assert!(xml.contains("<name>web &amp; db</name>"));
        assert!(xml.contains("passwd='s3&apos;cret'"));
        assert!(xml.contains("<boot dev='cdrom'/>"));
    }

    #[test]
    fn test_build_then_parse() {
        let domain = sample();
        let xml = DomainXmlBuilder::new(&domain).build();
        let parsed = parse_domain(&xml, &ParserOptions::new("i686", "de")).unwrap();

        assert_eq!(parsed.domain_type, DomainType::Kvm);
        assert_eq!(parsed.name, domain.name);
        assert_eq!(parsed.uuid, domain.uuid);
        assert_eq!(parsed.arch, "x86_64");
        assert_eq!(parsed.boot, domain.boot);
        assert_eq!(parsed.rtc_offset, "localtime");
        assert_eq!(parsed.max_mem, domain.max_mem);
        assert_eq!(parsed.vcpus, 2);
        assert_eq!(parsed.disks, domain.disks);
        assert_eq!(parsed.interfaces, domain.interfaces);
        assert_eq!(parsed.graphics, domain.graphics);
        assert_eq!(parsed.targethosts, domain.targethosts);
    }

    #[test]
    fn test_memory_keeps_odd_byte_counts() {
        let mut domain = sample();
        domain.max_mem = 1024 * 1024 + 1;
        domain.cur_mem = 3000;
        let xml = DomainXmlBuilder::new(&domain).build();
        assert!(xml.contains("<memory unit='b'>1048577</memory>"));

        let parsed = parse_domain(&xml, &ParserOptions::new("x86_64", "de")).unwrap();
        assert_eq!(parsed.max_mem, 1024 * 1024 + 1);
        assert_eq!(parsed.cur_mem, 3000);

        let xml = DomainXmlBuilder::new(&sample()).build();
        assert!(xml.contains("<memory unit='KiB'>1048576</memory>"));
    }

    #[test]
    fn test_template_supplies_emulator_and_machine() {
        let template = DomainTemplate {
            arch: "x86_64".to_string(),
            domain_type: "kvm".to_string(),
            os_type: "hvm".to_string(),
            emulator: "/usr/bin/kvm".to_string(),
            machines: vec!["pc".to_string()],
            loader: None,
            features: vec!["acpi".to_string(), "apic".to_string()],
        };
        let xml = DomainXmlBuilder::new(&sample()).with_template(Some(&template)).build();
        assert!(xml.contains("<type arch='x86_64' machine='pc'>hvm</type>"));
        assert!(xml.contains("<emulator>/usr/bin/kvm</emulator>"));
        assert!(xml.contains("<acpi/>"));
    }
}
