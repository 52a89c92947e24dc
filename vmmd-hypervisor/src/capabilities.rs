//! Node capability parsing.
//!
//! Every `guest/arch/domain` triple of a capabilities document becomes one
//! [`DomainTemplate`]; defining a domain is only accepted when one of them
//! matches.

use tracing::warn;
use vmmd_proto::DomainTemplate;

use crate::error::DescriptorError;
use crate::tree::{self, Element};

/// Parse a hypervisor capabilities document.
pub fn parse_capabilities(xml: &str) -> Result<Vec<DomainTemplate>, DescriptorError> {
    let root = tree::parse(xml)?;
    if root.name != "capabilities" {
        return Err(DescriptorError::UnexpectedRoot {
            found: root.name,
            expected: "capabilities",
        });
    }

    let mut templates = Vec::new();
    for guest in root.children_named("guest") {
        let os_type = guest.child_text("os_type").unwrap_or_default();
        let features = features_of(guest);

        for arch in guest.children_named("arch") {
            let Some(arch_name) = arch.attr("name") else {
                warn!(os_type, "Skipping guest architecture without name");
                continue;
            };

            for domain in arch.children_named("domain") {
                let domain_type = domain.attr("type").unwrap_or_default();
                let emulator = emulator_of(domain)
                    .or_else(|| emulator_of(arch))
                    .unwrap_or_default();
                if emulator.is_empty() {
                    warn!(arch = arch_name, domain_type, "No emulator specified");
                }

                let mut machines = machines_of(domain);
                if machines.is_empty() {
                    machines = machines_of(arch);
                }
                if machines.is_empty() {
                    warn!(arch = arch_name, domain_type, "No machines specified");
                }

                templates.push(DomainTemplate {
                    arch: arch_name.to_string(),
                    domain_type: domain_type.to_string(),
                    os_type: os_type.to_string(),
                    emulator: emulator.to_string(),
                    machines,
                    loader: arch.child_text("loader").map(str::to_string),
                    features: features.clone(),
                });
            }
        }
    }
    Ok(templates)
}

fn emulator_of(node: &Element) -> Option<&str> {
    node.child_text("emulator").filter(|e| !e.is_empty())
}

fn machines_of(node: &Element) -> Vec<String> {
    node.children_named("machine").map(|m| m.trimmed_text().to_string()).collect()
}

/// `pae`/`nonpae` (whichever comes first) plus default-on `acpi`/`apic`.
fn features_of(guest: &Element) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let Some(features) = guest.child("features") else {
        return names;
    };

    for feature in &features.children {
        let has = |name: &str| names.iter().any(|n| n == name);
        match feature.name.as_str() {
            "pae" if !has("nonpae") => names.push("pae".to_string()),
            "nonpae" if !has("pae") => names.push("nonpae".to_string()),
            "acpi" | "apic" if feature.attr("default") == Some("on") => {
                names.push(feature.name.clone())
            }
            _ => {}
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPABILITIES: &str = r#"
<capabilities>
  <host><uuid>44454c4c-3400-1056-8050-b4c04f4b4e31</uuid></host>
  <guest>
    <os_type>hvm</os_type>
    <arch name='x86_64'>
      <wordsize>64</wordsize>
      <emulator>/usr/bin/qemu-system-x86_64</emulator>
      <machine maxCpus='255'>pc-i440fx-2.1</machine>
      <machine canonical='pc-i440fx-2.1' maxCpus='255'>pc</machine>
      <domain type='qemu'/>
      <domain type='kvm'>
        <emulator>/usr/bin/kvm</emulator>
      </domain>
    </arch>
    <features>
      <acpi default='on' toggle='yes'/>
      <apic default='on' toggle='no'/>
      <pae/>
      <nonpae/>
    </features>
  </guest>
  <guest>
    <os_type>xen</os_type>
    <arch name='x86_64'>
      <loader>/usr/lib/xen/boot/hvmloader</loader>
      <domain type='xen'>
        <emulator>/usr/lib/xen/bin/qemu-dm</emulator>
        <machine>xenpv</machine>
      </domain>
    </arch>
  </guest>
</capabilities>"#;

    #[test]
    fn test_parse_capabilities() {
        let templates = parse_capabilities(CAPABILITIES).unwrap();
        assert_eq!(templates.len(), 3);

        let qemu = &templates[0];
        assert_eq!(qemu.domain_type, "qemu");
        assert_eq!(qemu.emulator, "/usr/bin/qemu-system-x86_64");
        assert_eq!(qemu.machines, ["pc-i440fx-2.1", "pc"]);
        assert_eq!(qemu.features, ["acpi", "apic", "pae"]);

        let kvm = &templates[1];
        assert_eq!(kvm.emulator, "/usr/bin/kvm");
        assert_eq!(kvm.machines, ["pc-i440fx-2.1", "pc"]);
        assert_eq!(kvm.loader, None);

        let xen = &templates[2];
        assert_eq!(xen.os_type, "xen");
        assert_eq!(xen.machines, ["xenpv"]);
        assert_eq!(xen.loader.as_deref(), Some("/usr/lib/xen/boot/hvmloader"));
        assert!(xen.features.is_empty());
    }

    #[test]
    fn test_rejects_other_documents() {
        assert!(matches!(
            parse_capabilities("<domain type='kvm'/>"),
            Err(DescriptorError::UnexpectedRoot { expected: "capabilities", .. })
        ));
    }
}
