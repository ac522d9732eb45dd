// src/etw/render.rs
//! Human-readable dump of a whole event: header line, then every top-level
//! property with array and struct nesting shown by indentation.
//!
//! ```text
//! Event ID = 1, Message = "Process %1 started."
//! [UINT32] ProcessID = 4242
//! Array[Size=2]
//!   [#0] [UINT8]  Flags = 1
//!   [#1] [UINT8]  Flags = 0
//! Struct "Entry"
//! {
//!   [UINT16] Port = 443
//! }
//! ```

use std::io;

use super::error::Result;
use super::schema::{EventSchema, EventStructure};

const INDENT: &str = "  ";

impl EventSchema<'_> {
    /// Render every property. Fails on the first value that cannot be
    /// decoded; unknown declared types are rendered, not rejected.
    pub fn render(&self) -> Result<String> {
        let mut out = String::new();
        self.render_header(&mut out);

        if self.is_string_only() {
            out.push_str(&self.event_string().to_display_string()?);
            out.push('\n');
            return Ok(out);
        }

        for index in 0..self.top_level_count()? {
            let len = self.array_size(index)?;
            let is_array = len > 1;
            if is_array {
                out.push_str(&format!("Array[Size={len}]\n"));
            }

            if self.is_property_struct(index)? {
                let structure = self.structure(index)?;
                match structure.name() {
                    Some(name) => {
                        out.push_str(&format!("Struct \"{name}\"\n"));
                    }
                    None => out.push_str("Struct\n"),
                }
                for instance in 0..len {
                    self.render_instance(&mut out, &structure, instance, is_array)?;
                }
            } else {
                for element in 0..len {
                    if is_array {
                        out.push_str(&format!("{INDENT}[#{element}] "));
                    }
                    out.push_str(&self.element(index, element)?.to_display_string()?);
                    out.push('\n');
                }
            }
        }
        Ok(out)
    }

    /// Render into any byte sink.
    pub fn write_to<W: io::Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(self.render()?.as_bytes())?;
        Ok(())
    }

    fn render_header(&self, out: &mut String) {
        out.push_str(&format!("Event ID = {}", self.event_id()));
        if let Some(message) = self.event_message() {
            out.push_str(&format!(", Message = \"{message}\""));
        }
        out.push('\n');
    }

    fn render_instance(
        &self,
        out: &mut String,
        structure: &EventStructure,
        instance: u32,
        is_array: bool,
    ) -> Result<()> {
        let outer = if is_array { INDENT } else { "" };
        if is_array {
            out.push_str(&format!("{INDENT}[#{instance}]\n"));
        }
        out.push_str(&format!("{outer}{{\n"));

        for member in 0..structure.member_count() {
            let len = self.member_len(structure, instance, member)?;
            let is_member_array = len > 1;
            if is_member_array {
                out.push_str(&format!("{outer}Array[Size={len}]\n"));
            }
            let inner = if is_member_array { INDENT } else { "" };
            for element in 0..len {
                let value = self.member_element(structure, instance, member, element)?;
                out.push_str(&format!("{outer}{inner}{INDENT}{}\n", value.to_display_string()?));
            }
        }

        out.push_str(&format!("{outer}}}\n"));
        Ok(())
    }
}
