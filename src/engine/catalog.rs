use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::timed;

use super::{Engine, EngineError, Missing};

fn check_price(what: &str, price: Decimal) -> Result<(), EngineError> {
    if price.is_sign_negative() && !price.is_zero() {
        return Err(EngineError::invalid_argument(format!("{what} cannot be negative: {price}")));
    }
    Ok(())
}

fn check_contact(field: &Option<String>) -> Result<(), EngineError> {
    if field.as_ref().is_some_and(|v| v.len() > MAX_CONTACT_LEN) {
        return Err(EngineError::LimitExceeded("guest contact field too long"));
    }
    Ok(())
}

/// Blank optional fields count as absent.
fn non_blank(field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl Engine {
    pub async fn create_room(
        &self,
        number: u32,
        category: RoomCategory,
        price: Decimal,
    ) -> Result<RoomInfo, EngineError> {
        timed("create_room", async {
            check_price("room price", price)?;
            let _gate = self.gate.read().await;
            let _catalog = self.catalog_lock.lock().await;
            if self.rooms.len() >= MAX_ROOMS {
                return Err(EngineError::LimitExceeded("too many rooms"));
            }
            if self.room_numbers.contains_key(&number) {
                return Err(EngineError::invalid_state(format!("room {number} already exists")));
            }

            let room = Room {
                id: Ulid::new(),
                number,
                category,
                status: RoomStatus::Vacant,
                price,
            };
            let event = Event::RoomCreated { room: room.clone() };
            self.commit(&event, &mut [], &mut []).await?;
            info!(room = number, category = category.describe(), %price, "room created");
            Ok(RoomInfo::from(&RoomState::new(room)))
        })
        .await
    }

    /// Existing reservations keep the base price they captured.
    pub async fn set_room_price(&self, number: u32, price: Decimal) -> Result<RoomInfo, EngineError> {
        timed("set_room_price", async {
            check_price("room price", price)?;
            let _gate = self.gate.read().await;
            let room_id = self.room_id(number)?;
            let mut rooms = self.lock_rooms(vec![room_id]).await?;
            let event = Event::RoomPriceChanged { room_id, price };
            self.commit(&event, &mut [], &mut rooms).await?;
            Ok(RoomInfo::from(&*rooms[0]))
        })
        .await
    }

    /// New beds start VACANT and go to the end of the allocation order.
    pub async fn add_bed(&self, room_number: u32) -> Result<Bed, EngineError> {
        timed("add_bed", async {
            let _gate = self.gate.read().await;
            let room_id = self.room_id(room_number)?;
            let mut rooms = self.lock_rooms(vec![room_id]).await?;
            if rooms[0].strategy() != AllocationStrategy::PerBed {
                return Err(EngineError::invalid_state(format!(
                    "room {room_number} is a {} and is let as a whole",
                    rooms[0].room.category.describe()
                )));
            }
            if rooms[0].beds.len() >= MAX_BEDS_PER_ROOM {
                return Err(EngineError::LimitExceeded("too many beds in room"));
            }

            let bed = Bed {
                id: Ulid::new(),
                room_id,
                status: BedStatus::Vacant,
            };
            let event = Event::BedAdded { bed: bed.clone() };
            self.commit(&event, &mut [], &mut rooms).await?;
            info!(room = room_number, bed = %bed.id, beds = rooms[0].beds.len(), "bed added");
            Ok(bed)
        })
        .await
    }

    /// Remove the first VACANT bed that no reservation holds on any night.
    pub async fn remove_bed(&self, room_number: u32) -> Result<Bed, EngineError> {
        timed("remove_bed", async {
            let _gate = self.gate.read().await;
            let room_id = self.room_id(room_number)?;
            let mut rooms = self.lock_rooms(vec![room_id]).await?;
            let rs = &rooms[0];
            let bed = rs
                .beds
                .iter()
                .find(|b| b.status == BedStatus::Vacant && !rs.has_entries_on_bed(b.id))
                .cloned()
                .ok_or_else(|| {
                    EngineError::invalid_state(format!("room {room_number} has no vacant bed to remove"))
                })?;

            let event = Event::BedRemoved { id: bed.id, room_id };
            self.commit(&event, &mut [], &mut rooms).await?;
            info!(room = room_number, bed = %bed.id, "bed removed");
            Ok(bed)
        })
        .await
    }

    /// Housekeeping status change. Allocation only looks at the ledger, never at this.
    pub async fn set_bed_status(&self, bed_id: Ulid, status: BedStatus) -> Result<Bed, EngineError> {
        timed("set_bed_status", async {
            let _gate = self.gate.read().await;
            let room_id = self
                .bed_to_room
                .get(&bed_id)
                .map(|e| *e.value())
                .ok_or(EngineError::NotFound(Missing::Bed(bed_id)))?;
            let mut rooms = self.lock_rooms(vec![room_id]).await?;
            if rooms[0].bed(&bed_id).is_none() {
                return Err(EngineError::NotFound(Missing::Bed(bed_id)));
            }
            let event = Event::BedStatusChanged {
                id: bed_id,
                room_id,
                status,
            };
            self.commit(&event, &mut [], &mut rooms).await?;
            rooms[0]
                .bed(&bed_id)
                .cloned()
                .ok_or(EngineError::NotFound(Missing::Bed(bed_id)))
        })
        .await
    }

    /// Guest names are unique.
    pub async fn register_guest(&self, info: GuestInfo) -> Result<Guest, EngineError> {
        timed("register_guest", async {
            let _gate = self.gate.read().await;
            let _catalog = self.catalog_lock.lock().await;
            if self.guest_names.contains_key(info.name.trim()) {
                return Err(EngineError::invalid_state(format!(
                    "guest {:?} already exists",
                    info.name.trim()
                )));
            }
            self.insert_guest(&info).await
        })
        .await
    }

    /// Look a guest up by name, creating it if absent. Non-blank contact fields in
    /// `info` overwrite the stored ones.
    pub async fn find_or_create_guest(&self, info: GuestInfo) -> Result<Guest, EngineError> {
        timed("find_or_create_guest", async {
            let _gate = self.gate.read().await;
            self.find_or_create_guest_inner(&info).await
        })
        .await
    }

    /// Caller holds the gate.
    pub(super) async fn find_or_create_guest_inner(&self, info: &GuestInfo) -> Result<Guest, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let Ok(id) = self.guest_id(&info.name) else {
            return self.insert_guest(info).await;
        };
        let existing = self
            .guests
            .get(&id)
            .map(|g| g.value().clone())
            .ok_or_else(|| EngineError::NotFound(Missing::Guest(info.name.clone())))?;

        let document = non_blank(&info.document).or_else(|| existing.document.clone());
        let phone = non_blank(&info.phone).or_else(|| existing.phone.clone());
        let email = non_blank(&info.email).or_else(|| existing.email.clone());
        if document == existing.document && phone == existing.phone && email == existing.email {
            return Ok(existing);
        }
        check_contact(&document)?;
        check_contact(&phone)?;
        check_contact(&email)?;

        let event = Event::GuestUpdated {
            id,
            document,
            phone,
            email,
        };
        self.commit(&event, &mut [], &mut []).await?;
        info!(guest = %existing.name, "guest contact details updated");
        self.guests
            .get(&id)
            .map(|g| g.value().clone())
            .ok_or_else(|| EngineError::NotFound(Missing::Guest(info.name.clone())))
    }

    /// Guest named by a calendar feed. Created with a placeholder document marking
    /// it as imported; an existing guest is left untouched. Caller holds the gate.
    pub(super) async fn imported_guest_inner(&self, name: &str) -> Result<Guest, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if let Ok(guest) = self.guest_by_name(name) {
            return Ok(guest);
        }
        let info = GuestInfo {
            name: name.to_string(),
            document: Some(format!("imported-{}", Ulid::new())),
            ..GuestInfo::default()
        };
        self.insert_guest(&info).await
    }

    /// Caller holds the gate and the catalog lock.
    async fn insert_guest(&self, info: &GuestInfo) -> Result<Guest, EngineError> {
        let name = info.name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::invalid_argument("guest name is empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("guest name too long"));
        }
        if self.guests.len() >= MAX_GUESTS {
            return Err(EngineError::LimitExceeded("too many guests"));
        }
        let (document, phone, email) = (
            non_blank(&info.document),
            non_blank(&info.phone),
            non_blank(&info.email),
        );
        check_contact(&document)?;
        check_contact(&phone)?;
        check_contact(&email)?;

        let guest = Guest {
            id: Ulid::new(),
            name,
            document,
            phone,
            email,
            reservations: Default::default(),
        };
        let event = Event::GuestRegistered {
            id: guest.id,
            name: guest.name.clone(),
            document: guest.document.clone(),
            phone: guest.phone.clone(),
            email: guest.email.clone(),
        };
        self.commit(&event, &mut [], &mut []).await?;
        info!(guest = %guest.name, id = %guest.id, "guest registered");
        Ok(guest)
    }

    pub fn guest_by_name(&self, name: &str) -> Result<Guest, EngineError> {
        let id = self.guest_id(name)?;
        self.guests
            .get(&id)
            .map(|g| g.value().clone())
            .ok_or_else(|| EngineError::NotFound(Missing::Guest(name.trim().to_string())))
    }

    pub async fn room_by_number(&self, number: u32) -> Result<RoomInfo, EngineError> {
        let shared = self.shared_room(&self.room_id(number)?)?;
        let rs = shared.read().await;
        Ok(RoomInfo::from(&*rs))
    }

    /// Every room, ordered by number.
    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let shared: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(shared.len());
        for rs in shared {
            rooms.push(RoomInfo::from(&*rs.read().await));
        }
        rooms.sort_by_key(|r| r.number);
        rooms
    }
}
