// Copyright (C) 2024, 2025 MVSPool Developers (see AUTHORS)
//
// This file is part of MVSPool
//
// MVSPool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// MVSPool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// MVSPool. If not, see <https://www.gnu.org/licenses/>.

pub mod config;
pub mod logging;
pub mod policy;
pub mod proxy;
pub mod storage;
pub mod unlocker;
pub mod upstream;
pub mod util;
pub mod work;
