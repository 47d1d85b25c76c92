/**********************************************************************

Copyright (C) 2021 by reddal

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

**********************************************************************/

/*!
An implementation of the client side of shadowsocks protocol.
See more at <https://shadowsocks.org/en/wiki/Protocol.html>

Both AEAD methods and legacy stream methods are supported.
Legacy stream methods provide no authentication, use them only
when the server does not support anything else.
*/

pub mod outbound;
pub mod tcp;
mod utils;

pub use outbound::{Dialer, Settings, SettingsBuilder};
pub use tcp::{ClientReadHalf, ClientStream, ClientWriteHalf};
pub use utils::{key_to_session_key, password_to_key, Error, Kind, Method, Primitive};
