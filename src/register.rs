use crate::schema::{Meter, MeterType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeterEntry {
    pub id: String,
    pub meter_number: String,
    pub name: String,
    pub meter_type: MeterType,
    pub tariff_structure_id: Option<String>,
}

/// A site's meters grouped by type, each group sorted by meter number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterRegister {
    pub site_id: String,
    pub bulk: Vec<MeterEntry>,
    pub solar: Vec<MeterEntry>,
    pub tenant: Vec<MeterEntry>,
    pub council: Vec<MeterEntry>,
    pub other: Vec<MeterEntry>,
}

impl MeterRegister {
    pub fn from_meters(site_id: &str, meters: &[Meter]) -> Self {
        let mut bulk = Vec::new();
        let mut solar = Vec::new();
        let mut tenant = Vec::new();
        let mut council = Vec::new();
        let mut other = Vec::new();

        for meter in meters.iter().filter(|m| m.site_id == site_id) {
            let entry = MeterEntry {
                id: meter.id.clone(),
                meter_number: meter.meter_number.clone(),
                name: meter.name.clone(),
                meter_type: meter.meter_type,
                tariff_structure_id: meter.tariff_structure_id.clone(),
            };

            match meter.meter_type {
                MeterType::Bulk => bulk.push(entry),
                MeterType::Solar => solar.push(entry),
                MeterType::Tenant => tenant.push(entry),
                MeterType::Council => council.push(entry),
                MeterType::Other => other.push(entry),
            }
        }

        for group in [&mut bulk, &mut solar, &mut tenant, &mut council, &mut other] {
            group.sort_by(|a, b| a.meter_number.cmp(&b.meter_number));
        }

        Self {
            site_id: site_id.to_string(),
            bulk,
            solar,
            tenant,
            council,
            other,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &MeterEntry> {
        self.bulk
            .iter()
            .chain(self.solar.iter())
            .chain(self.tenant.iter())
            .chain(self.council.iter())
            .chain(self.other.iter())
    }

    pub fn total_meters(&self) -> usize {
        self.entries().count()
    }

    pub fn find_by_number(&self, meter_number: &str) -> Option<&MeterEntry> {
        self.entries().find(|e| e.meter_number == meter_number)
    }

    /// Meters that cannot be costed because no tariff is assigned.
    pub fn without_tariff(&self) -> Vec<&MeterEntry> {
        self.entries()
            .filter(|e| e.tariff_structure_id.is_none())
            .collect()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("# Meter Register - {}\n\n", self.site_id));

        let sections = [
            ("Bulk", &self.bulk),
            ("Solar", &self.solar),
            ("Tenant", &self.tenant),
            ("Council", &self.council),
            ("Other", &self.other),
        ];

        for (title, entries) in sections {
            if entries.is_empty() {
                continue;
            }
            output.push_str(&format!("## {}\n\n", title));
            for entry in entries {
                let tariff_marker = if entry.tariff_structure_id.is_none() {
                    " **[NO TARIFF]**"
                } else {
                    ""
                };
                output.push_str(&format!(
                    "- {} ({}){}\n",
                    entry.meter_number, entry.name, tariff_marker
                ));
            }
            output.push('\n');
        }

        output
    }
}
