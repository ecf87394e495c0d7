//! libvirt descriptor generation
//!
//! Builders for the small XML documents the scenarios hand to virsh: disk
//! devices (volume or block backed, with persistent reservations and
//! authentication), iSCSI secrets, vHBA node devices and domain checkpoints.

use color_eyre::{eyre::eyre, Result};
use std::str::FromStr;

use crate::error::ConfigError;
use crate::xml_utils::{XmlNode, XmlWriter};

/// Where a disk's data comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    /// A volume in a storage pool
    Volume {
        /// Pool name
        pool: String,
        /// Volume name
        volume: String,
    },
    /// A host block device
    Block {
        /// Device path, e.g. /dev/sdb
        dev: String,
    },
    /// A host file
    File {
        /// File path
        path: String,
    },
}

impl DiskSource {
    fn type_name(&self) -> &'static str {
        match self {
            DiskSource::Volume { .. } => "volume",
            DiskSource::Block { .. } => "block",
            DiskSource::File { .. } => "file",
        }
    }
}

/// SCSI persistent reservation settings of a disk source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservations {
    /// libvirt manages the pr-helper
    Managed,
    /// Connect to an externally managed pr-helper
    Unmanaged {
        /// Socket type (usually `unix`)
        source_type: String,
        /// Socket path
        path: String,
        /// `client` or `server`
        mode: String,
    },
}

/// How a disk's auth element refers to its secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretRef {
    /// By secret UUID
    Uuid(String),
    /// By usage name
    Usage(String),
}

/// Which element carries the `<auth>` sub-element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum AuthPlace {
    /// Inside `<source>`
    Source,
    /// Directly under `<disk>`
    Disk,
    /// In both places
    Both,
}

/// Disk authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskAuth {
    /// CHAP user name
    pub username: String,
    /// Secret usage type, e.g. `iscsi`
    pub secret_type: String,
    /// Reference to the secret
    pub secret: SecretRef,
    /// Placement of the element
    pub place: AuthPlace,
}

impl DiskAuth {
    fn to_node(&self) -> XmlNode {
        let secret = XmlNode::new("secret").with_attr("type", &self.secret_type);
        let secret = match &self.secret {
            SecretRef::Uuid(uuid) => secret.with_attr("uuid", uuid),
            SecretRef::Usage(usage) => secret.with_attr("usage", usage),
        };
        XmlNode::new("auth")
            .with_attr("username", &self.username)
            .with_child(secret)
    }
}

/// Builder for a `<disk>` device element.
#[derive(Debug, Clone)]
pub struct DiskBuilder {
    source: DiskSource,
    device: String,
    driver_type: String,
    target_dev: String,
    target_bus: String,
    reservations: Option<Reservations>,
    auth: Option<DiskAuth>,
}

impl DiskBuilder {
    /// A `disk` device backed by `source`, exposed as `target_dev` on virtio.
    pub fn new(source: DiskSource, target_dev: &str) -> Self {
        Self {
            source,
            device: "disk".to_owned(),
            driver_type: "raw".to_owned(),
            target_dev: target_dev.to_owned(),
            target_bus: "virtio".to_owned(),
            reservations: None,
            auth: None,
        }
    }

    /// Set the device kind (`disk`, `lun`, `cdrom`).
    pub fn with_device(mut self, device: &str) -> Self {
        self.device = device.to_owned();
        self
    }

    /// Set the driver format (`raw`, `qcow2`).
    pub fn with_driver_type(mut self, driver_type: &str) -> Self {
        self.driver_type = driver_type.to_owned();
        self
    }

    /// Set the target bus.
    pub fn with_bus(mut self, bus: &str) -> Self {
        self.target_bus = bus.to_owned();
        self
    }

    /// Add persistent reservation settings to the source.
    pub fn with_reservations(mut self, reservations: Reservations) -> Self {
        self.reservations = Some(reservations);
        self
    }

    /// Add authentication.
    pub fn with_auth(mut self, auth: DiskAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Build the element tree.
    pub fn build_node(&self) -> XmlNode {
        let mut source = match &self.source {
            DiskSource::Volume { pool, volume } => XmlNode::new("source")
                .with_attr("pool", pool)
                .with_attr("volume", volume),
            DiskSource::Block { dev } => XmlNode::new("source").with_attr("dev", dev),
            DiskSource::File { path } => XmlNode::new("source").with_attr("file", path),
        };

        let mut disk = XmlNode::new("disk")
            .with_attr("type", self.source.type_name())
            .with_attr("device", &self.device)
            .with_child(
                XmlNode::new("driver")
                    .with_attr("name", "qemu")
                    .with_attr("type", &self.driver_type),
            );

        if let Some(auth) = &self.auth {
            if matches!(auth.place, AuthPlace::Disk | AuthPlace::Both) {
                disk.children.push(auth.to_node());
            }
            if matches!(auth.place, AuthPlace::Source | AuthPlace::Both) {
                source.children.push(auth.to_node());
            }
        }

        match &self.reservations {
            Some(Reservations::Managed) => {
                source
                    .children
                    .push(XmlNode::new("reservations").with_attr("managed", "yes"));
            }
            Some(Reservations::Unmanaged {
                source_type,
                path,
                mode,
            }) => {
                source.children.push(
                    XmlNode::new("reservations")
                        .with_attr("managed", "no")
                        .with_child(
                            XmlNode::new("source")
                                .with_attr("type", source_type)
                                .with_attr("path", path)
                                .with_attr("mode", mode),
                        ),
                );
            }
            None => {}
        }

        disk.with_child(source).with_child(
            XmlNode::new("target")
                .with_attr("dev", &self.target_dev)
                .with_attr("bus", &self.target_bus),
        )
    }

    /// Build the disk XML.
    pub fn build_xml(&self) -> Result<String> {
        self.build_node().to_xml()
    }
}

/// Builder for a `<secret>` descriptor with an iSCSI usage.
#[derive(Debug, Clone)]
pub struct SecretBuilder {
    description: Option<String>,
    usage_type: String,
    usage_target: String,
}

impl SecretBuilder {
    /// An iSCSI secret for `usage_target`.
    pub fn iscsi(usage_target: &str) -> Self {
        Self {
            description: None,
            usage_type: "iscsi".to_owned(),
            usage_target: usage_target.to_owned(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_owned());
        self
    }

    /// Build the secret XML.
    pub fn build_xml(&self) -> Result<String> {
        if self.usage_target.is_empty() {
            return Err(eyre!("Secret usage target is required"));
        }
        let mut writer = XmlWriter::indented();
        writer.start_element("secret", &[("ephemeral", "no"), ("private", "yes")])?;
        if let Some(description) = &self.description {
            writer.write_text_element("description", description)?;
        }
        writer.start_element("usage", &[("type", self.usage_type.as_str())])?;
        writer.write_text_element("target", &self.usage_target)?;
        writer.end_element("usage")?;
        writer.end_element("secret")?;
        writer.into_string()
    }
}

/// Node device XML for an NPIV vHBA.
pub fn vhba_xml(parent: &str, wwnn: &str, wwpn: &str) -> Result<String> {
    let mut writer = XmlWriter::indented();
    writer.start_element("device", &[])?;
    writer.write_text_element("parent", parent)?;
    writer.start_element("capability", &[("type", "scsi_host")])?;
    writer.start_element("capability", &[("type", "fc_host")])?;
    writer.write_text_element("wwnn", wwnn)?;
    writer.write_text_element("wwpn", wwpn)?;
    writer.end_element("capability")?;
    writer.end_element("capability")?;
    writer.end_element("device")?;
    writer.into_string()
}

/// Per-disk entry of a checkpoint: `name:mode[:bitmap]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointDisk {
    /// Disk target name, e.g. vda
    pub name: String,
    /// `no` or `bitmap`
    pub checkpoint: String,
    /// Bitmap name for `bitmap` mode
    pub bitmap: Option<String>,
}

impl FromStr for CheckpointDisk {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::Syntax(format!("expected name:mode[:bitmap], got '{s}'"));
        let mut parts = s.trim().split(':');
        let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(bad)?;
        let checkpoint = parts.next().filter(|c| !c.is_empty()).ok_or_else(bad)?;
        let bitmap = parts.next().map(str::to_owned);
        if parts.next().is_some() {
            return Err(bad());
        }
        let valid = matches!((checkpoint, bitmap.is_some()), ("no", false) | ("bitmap", _));
        if !valid {
            return Err(bad());
        }
        Ok(Self {
            name: name.to_owned(),
            checkpoint: checkpoint.to_owned(),
            bitmap,
        })
    }
}

/// Parse a comma-separated list of checkpoint disks.
pub fn parse_checkpoint_disks(spec: &str) -> Result<Vec<CheckpointDisk>, ConfigError> {
    spec.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Build `<domaincheckpoint>` XML.
pub fn checkpoint_xml(
    name: &str,
    description: Option<&str>,
    disks: &[CheckpointDisk],
) -> Result<String> {
    let mut writer = XmlWriter::indented();
    writer.start_element("domaincheckpoint", &[])?;
    writer.write_text_element("name", name)?;
    if let Some(description) = description {
        writer.write_text_element("description", description)?;
    }
    if !disks.is_empty() {
        writer.start_element("disks", &[])?;
        for disk in disks {
            let mut attrs = vec![("name", disk.name.as_str()), ("checkpoint", disk.checkpoint.as_str())];
            if let Some(bitmap) = &disk.bitmap {
                attrs.push(("bitmap", bitmap.as_str()));
            }
            writer.write_empty_element("disk", &attrs)?;
        }
        writer.end_element("disks")?;
    }
    writer.end_element("domaincheckpoint")?;
    writer.into_string()
}
