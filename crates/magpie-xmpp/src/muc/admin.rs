//! MUC admin (`muc#admin`) and owner (`muc#owner`) queries.
//!
//! Admin sets are transactional: the whole batch is validated (bare JIDs,
//! privilege ceilings, self-role changes, owner survival) before any change
//! is applied.

use std::collections::HashSet;

use minidom::Element;
use tracing::info;

use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::server::Server;
use crate::stanza::{ns, Stanza};
use crate::storage::Storage;
use crate::types::{Affiliation, Role};
use crate::util::{is_bare_jid, jid_to_bare, jid_to_resource};

use super::{AffiliationRecord, MucExtension, Room};

fn form_field(var: &str, field_type: &str, label: Option<&str>, value: &str) -> Element {
    let mut field = Element::builder("field", ns::DATA_FORMS)
        .attr("var", var)
        .attr("type", field_type);
    if let Some(label) = label {
        field = field.attr("label", label);
    }
    field
        .append(
            Element::builder("value", ns::DATA_FORMS)
                .append(value)
                .build(),
        )
        .build()
}

fn form_bool(value: &str) -> bool {
    value == "1" || value == "true"
}

/// Extract `var → first value` pairs from a submitted data form.
fn form_values(form: &Element) -> Vec<(String, String)> {
    form.children()
        .filter(|c| c.name() == "field")
        .filter_map(|field| {
            let var = field.attr("var")?.to_string();
            let value = field
                .children()
                .find(|c| c.name() == "value")
                .map(|v| v.text())
                .unwrap_or_default();
            Some((var, value))
        })
        .collect()
}

impl MucExtension {
    async fn reply_error(
        &self,
        server: &Server,
        stanza: &Stanza,
        error_type: StanzaErrorType,
        condition: StanzaErrorCondition,
    ) {
        server.send_packet(stanza.error_reply(error_type, condition)).await;
    }

    pub(crate) async fn handle_admin_iq(
        &self,
        server: &Server,
        stanza: &Stanza,
        room: &mut Room,
    ) -> Result<(), XmppError> {
        let requester = stanza.from().to_string();
        let requester_affiliation = room.affiliation_of(&self.config.admins, &requester);
        if requester_affiliation < Affiliation::Admin {
            self.reply_error(
                server,
                stanza,
                StanzaErrorType::Auth,
                StanzaErrorCondition::Forbidden,
            )
            .await;
            return Ok(());
        }

        let Some(query) = stanza.child("query", ns::MUC_ADMIN).cloned() else {
            return Ok(());
        };
        let items: Vec<Element> = query
            .children()
            .filter(|c| c.name() == "item")
            .cloned()
            .collect();

        if stanza.type_attr() == "get" && !items.is_empty() {
            // list every JID holding the requested affiliation
            let Some(filter) = items[0]
                .attr("affiliation")
                .and_then(Affiliation::from_str)
            else {
                self.reply_error(
                    server,
                    stanza,
                    StanzaErrorType::Cancel,
                    StanzaErrorCondition::BadRequest,
                )
                .await;
                return Ok(());
            };
            let mut listing = Element::builder("query", ns::MUC_ADMIN);
            let mut jids: Vec<&String> = room
                .affiliations
                .iter()
                .filter(|(_, affiliation)| **affiliation == filter)
                .map(|(jid, _)| jid)
                .collect();
            jids.sort();
            for jid in jids {
                listing = listing.append(
                    Element::builder("item", ns::MUC_ADMIN)
                        .attr("jid", jid.as_str())
                        .attr("affiliation", filter.as_str())
                        .build(),
                );
            }
            let mut response = stanza.result_for();
            response.append(listing.build());
            server.send_packet(response).await;
            return Ok(());
        }

        if stanza.type_attr() != "set" {
            self.reply_error(
                server,
                stanza,
                StanzaErrorType::Cancel,
                StanzaErrorCondition::BadRequest,
            )
            .await;
            return Ok(());
        }

        // validation pass over the whole batch
        let mut owner_jids: HashSet<String> = room
            .affiliations
            .iter()
            .filter(|(_, affiliation)| **affiliation == Affiliation::Owner)
            .map(|(jid, _)| jid.clone())
            .collect();

        for item in &items {
            if let Some(affiliation_attr) = item.attr("affiliation") {
                let Some(new_affiliation) = Affiliation::from_str(affiliation_attr) else {
                    self.reply_error(
                        server,
                        stanza,
                        StanzaErrorType::Cancel,
                        StanzaErrorCondition::BadRequest,
                    )
                    .await;
                    return Ok(());
                };
                let jid = item.attr("jid").unwrap_or("");
                if !is_bare_jid(jid) {
                    self.reply_error(
                        server,
                        stanza,
                        StanzaErrorType::Cancel,
                        StanzaErrorCondition::BadRequest,
                    )
                    .await;
                    return Ok(());
                }
                // only owners touch admin or owner affiliations
                let current = room.affiliation_of(&self.config.admins, jid);
                if requester_affiliation < Affiliation::Owner
                    && (current >= Affiliation::Admin || new_affiliation >= Affiliation::Admin)
                {
                    self.reply_error(
                        server,
                        stanza,
                        StanzaErrorType::Cancel,
                        StanzaErrorCondition::NotAllowed,
                    )
                    .await;
                    return Ok(());
                }
                if new_affiliation == Affiliation::Owner {
                    owner_jids.insert(jid.to_string());
                } else {
                    owner_jids.remove(jid);
                }
            }

            if item.attr("role").is_some() {
                let nick = item.attr("nick").unwrap_or("");
                let nick_jid = format!("{}/{}", room.jid, nick);
                if let Some(occupant) = room
                    .occupants
                    .id_by_nick(&nick_jid)
                    .and_then(|id| room.occupants.get(id))
                {
                    if occupant.real_jid == requester {
                        self.reply_error(
                            server,
                            stanza,
                            StanzaErrorType::Cancel,
                            StanzaErrorCondition::Conflict,
                        )
                        .await;
                        return Ok(());
                    }
                }
            }
        }

        // the room must keep at least one owner
        if owner_jids.is_empty() {
            self.reply_error(
                server,
                stanza,
                StanzaErrorType::Cancel,
                StanzaErrorCondition::Conflict,
            )
            .await;
            return Ok(());
        }

        // apply pass
        let mut queued: Vec<Stanza> = Vec::new();
        for item in &items {
            let mut changed: HashSet<usize> = HashSet::new();

            if let Some(new_affiliation) =
                item.attr("affiliation").and_then(Affiliation::from_str)
            {
                let jid = item.attr("jid").unwrap_or("").to_string();
                for (id, occupant) in room.occupants.iter() {
                    if jid_to_bare(&occupant.real_jid) == jid {
                        changed.insert(id);
                    }
                }
                if new_affiliation == Affiliation::None {
                    room.affiliations.remove(&jid);
                    if room.persistent {
                        server.storage().delete_muc_affiliation(&room.jid, &jid).await?;
                    }
                } else {
                    room.affiliations.insert(jid.clone(), new_affiliation);
                    if room.persistent {
                        server
                            .storage()
                            .save_muc_affiliation(&AffiliationRecord {
                                room: room.jid.clone(),
                                jid,
                                affiliation: new_affiliation,
                            })
                            .await?;
                    }
                }
            }

            if let Some(new_role) = item.attr("role").and_then(Role::from_str) {
                let nick = item.attr("nick").unwrap_or("");
                let nick_jid = format!("{}/{}", room.jid, nick);
                if let Some(id) = room.occupants.id_by_nick(&nick_jid) {
                    if new_role == Role::None {
                        // kick
                        let reason = item
                            .children()
                            .find(|c| c.name() == "reason")
                            .map(|r| r.text());
                        if let Some(occupant) = room.occupants.get_mut(id) {
                            occupant.role = Role::None;
                        }
                        if let Some(kicked) = room.occupants.get(id).cloned() {
                            info!(
                                nick = jid_to_resource(&kicked.room_jid),
                                jid = %kicked.real_jid,
                                room = %room.jid,
                                "kicking occupant"
                            );
                            let base = Stanza::presence_type("unavailable");
                            let to_kicked = self.occupant_presence(
                                &base,
                                room,
                                &kicked,
                                &kicked,
                                Some(307),
                                reason.as_deref(),
                            );
                            server.send_packet(to_kicked).await;

                            for (other_id, other) in room.occupants.iter() {
                                if other_id == id {
                                    continue;
                                }
                                queued.push(self.occupant_presence(
                                    &base,
                                    room,
                                    &kicked,
                                    other,
                                    Some(307),
                                    None,
                                ));
                            }
                        }
                        room.occupants.remove(id);
                        changed.remove(&id);
                    } else {
                        if let Some(occupant) = room.occupants.get_mut(id) {
                            occupant.role = new_role;
                        }
                        changed.insert(id);
                    }
                }
            }

            // everyone sees the new state of each changed occupant
            for id in changed {
                let Some(subject) = room.occupants.get(id).cloned() else {
                    continue;
                };
                for (_, recipient) in room.occupants.iter() {
                    queued.push(self.occupant_presence(
                        &Stanza::presence(),
                        room,
                        &subject,
                        recipient,
                        None,
                        None,
                    ));
                }
            }
        }

        server.send_packet(stanza.result_for()).await;
        for presence in queued {
            server.send_packet(presence).await;
        }
        Ok(())
    }

    pub(crate) async fn handle_owner_iq(
        &self,
        server: &Server,
        stanza: &Stanza,
        room: &mut Room,
    ) -> Result<(), XmppError> {
        let requester = stanza.from();
        let is_admin = self
            .config
            .admins
            .iter()
            .any(|a| a == jid_to_bare(requester));
        if room.affiliation_of(&self.config.admins, requester) != Affiliation::Owner {
            self.reply_error(
                server,
                stanza,
                StanzaErrorType::Auth,
                StanzaErrorCondition::Forbidden,
            )
            .await;
            return Ok(());
        }

        match stanza.type_attr() {
            "get" => {
                let mut form = Element::builder("x", ns::DATA_FORMS)
                    .attr("type", "form")
                    .append(
                        Element::builder("title", ns::DATA_FORMS)
                            .append(format!("Configuration of room {}", room.jid))
                            .build(),
                    )
                    .append(form_field(
                        "FORM_TYPE",
                        "hidden",
                        None,
                        "http://jabber.org/protocol/muc#roomconfig",
                    ))
                    .append(form_field(
                        "muc#roomconfig_roomname",
                        "text-single",
                        Some("Room title"),
                        &room.name,
                    ))
                    .append(form_field(
                        "muc#roomconfig_membersonly",
                        "boolean",
                        Some("Make room members-only"),
                        if room.members_only { "1" } else { "0" },
                    ));
                if is_admin {
                    form = form
                        .append(form_field(
                            "muc#roomconfig_persistentroom",
                            "boolean",
                            Some("Make room persistent"),
                            if room.persistent { "1" } else { "0" },
                        ))
                        .append(form_field(
                            "muc#roomconfig_publicroom",
                            "boolean",
                            Some("Make room public searchable"),
                            if room.public { "1" } else { "0" },
                        ));
                }
                let query = Element::builder("query", ns::MUC_OWNER)
                    .append(form.build())
                    .build();
                let mut response = stanza.result_for();
                response.append(query);
                server.send_packet(response).await;
            }
            "set" => {
                let form = stanza
                    .child("query", ns::MUC_OWNER)
                    .and_then(|q| q.get_child("x", ns::DATA_FORMS))
                    .cloned();
                let Some(form) = form else {
                    self.reply_error(
                        server,
                        stanza,
                        StanzaErrorType::Cancel,
                        StanzaErrorCondition::BadRequest,
                    )
                    .await;
                    return Ok(());
                };

                let was_persistent = room.persistent;
                for (var, value) in form_values(&form) {
                    match var.as_str() {
                        "muc#roomconfig_roomname" => room.name = value,
                        "muc#roomconfig_membersonly" => room.members_only = form_bool(&value),
                        "muc#roomconfig_persistentroom" if is_admin => {
                            room.persistent = form_bool(&value)
                        }
                        "muc#roomconfig_publicroom" if is_admin => {
                            room.public = form_bool(&value)
                        }
                        _ => {}
                    }
                }

                if room.persistent {
                    server.storage().save_muc_room(&room.to_record()).await?;
                    if !was_persistent {
                        for (jid, affiliation) in &room.affiliations {
                            server
                                .storage()
                                .save_muc_affiliation(&AffiliationRecord {
                                    room: room.jid.clone(),
                                    jid: jid.clone(),
                                    affiliation: *affiliation,
                                })
                                .await?;
                        }
                    }
                } else if was_persistent {
                    server.storage().delete_muc_affiliations(&room.jid).await?;
                    server.storage().delete_muc_room(&room.jid).await?;
                }

                server.send_packet(stanza.result_for()).await;
            }
            _ => {}
        }
        Ok(())
    }
}
